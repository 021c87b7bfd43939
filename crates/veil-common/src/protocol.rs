//! Protocol constants shared by both session roles.
//!
//! Both endpoints must agree on these: the first payload after accept is the
//! raw session key, and every payload after that is one encrypted blob per
//! message, read in a single bounded-size read. There is no length-prefix
//! framing; a message must fit one read.

use std::time::Duration;

/// Default chat port when none is given.
pub const DEFAULT_PORT: u16 = 8080;

/// Maximum bytes consumed per receive call. Also bounds the key-exchange
/// read on the dialer side.
pub const RECV_BUFFER_SIZE: usize = 4096;

/// How long a receive blocks before re-checking the running flag.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on the dialer's connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Operator commands that end the session without sending anything.
/// Matched case-insensitively against the trimmed line.
pub const QUIT_COMMANDS: [&str; 3] = ["/quit", "/exit", "/q"];

/// Operator command that clears the terminal display.
pub const CLEAR_COMMAND: &str = "/clear";
