//! Method name constants for every JSON-RPC method the client sends.
//!
//! Each constant is the exact string sent over the wire as the `method`
//! field of a JSON-RPC request.

/// All client → server method names, grouped by namespace.
pub struct Methods;

impl Methods {
    // ── Lifecycle ───────────────────────────────────────────────────────
    pub const INITIALIZE: &str = "initialize";
    pub const SERVER_INFO: &str = "server/info";

    // ── Tools & resources ───────────────────────────────────────────────
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_READ: &str = "resources/read";

    // ── Raw input ───────────────────────────────────────────────────────
    pub const INPUT_HANDLE: &str = "input/handle";

    // ── Speech ──────────────────────────────────────────────────────────
    pub const SPEECH_START: &str = "speech/start";
    pub const SPEECH_CHUNK: &str = "speech/chunk";
    pub const SPEECH_END: &str = "speech/end";
}

/// Type alias for method names.
pub type MethodName = &'static str;

/// All known method names (for validation).
pub const ALL_METHODS: &[&str] = &[
    Methods::INITIALIZE,
    Methods::SERVER_INFO,
    Methods::TOOLS_CALL,
    Methods::RESOURCES_READ,
    Methods::INPUT_HANDLE,
    Methods::SPEECH_START,
    Methods::SPEECH_CHUNK,
    Methods::SPEECH_END,
];

/// Check if a method name is known.
pub fn is_known_method(method: &str) -> bool {
    ALL_METHODS.contains(&method)
}
