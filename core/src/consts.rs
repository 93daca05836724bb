/// The default maximum number of `loop()` invocations before the interpreter
/// terminates cleanly. Inner `for`/`while`/`do` loops are held to the same
/// ceiling, per loop header. Hitting the ceiling is a normal termination
/// (`PROGRAM_END` with `reason: "loop_limit"`), not an error.
pub const DEFAULT_MAX_LOOP_ITERATIONS: u32 = 1000;

/// The default maximum user-function call depth. Exceeding it raises a
/// `StackOverflow` runtime error.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 64;

/// The default soft ceiling on total value-heap residency: 8 MiB PSRAM plus
/// 512 KiB RAM, matching the reference ESP32 deployment.
pub const DEFAULT_MEMORY_LIMIT: usize = 8 * 1024 * 1024 + 512 * 1024;

/// Magic bytes at the start of every CompactAST blob.
pub const COMPACT_AST_MAGIC: [u8; 4] = *b"CAST";

/// The one CompactAST format version this crate decodes (v3.2).
pub const COMPACT_AST_VERSION: u16 = 0x0302;

/// Byte length of the CompactAST header.
pub const HEADER_LEN: usize = 20;

/// Maximum node nesting the decoder will follow. Offset-based child links
/// could otherwise form a cycle and recurse forever.
pub const MAX_DECODE_DEPTH: usize = 512;

/// Number of events retained by the execution tracer before the oldest are
/// dropped.
pub const TRACE_CAPACITY: usize = 1024;
