/// Upstream Cloud Code hosts, in failover order. The primary is always tried first.
pub const UPSTREAM_ENDPOINTS: &[&str] = &[
    "https://cloudcode-pa.googleapis.com",
    "https://daily-cloudcode-pa.sandbox.googleapis.com",
    "https://autopush-cloudcode-pa.sandbox.googleapis.com",
];

pub const UPSTREAM_STREAM_PATH: &str = "/v1internal:streamGenerateContent?alt=sse";

/// User agent the upstream expects in the request envelope and HTTP headers.
pub const UPSTREAM_USER_AGENT: &str = "antigravity";

/// Prefix for the per-request id inside the upstream envelope.
pub const REQUEST_ID_PREFIX: &str = "agw";

/// Opaque marker the upstream accepts in place of a thought signature it
/// cannot validate (e.g. a signature minted by a different model family).
pub const SKIP_SIGNATURE_SENTINEL: &str = "skip_thought_signature_validator";

/// Beta header required for interleaved thinking on Claude-family models.
pub const INTERLEAVED_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";

/// Total attempts across accounts for one inbound request.
pub const MAX_UPSTREAM_ATTEMPTS: usize = 3;

/// How long the first chunk of an upstream stream may take before the
/// stream is declared silent and the attempt is retried elsewhere.
pub const FIRST_CHUNK_TIMEOUT_SECS: u64 = 30;

/// Base cooldown applied to an account after a 429 when the upstream does
/// not provide its own reset time.
pub const BASE_COOLDOWN_SECS: u64 = 60;

/// Backoff multiplier cap for consecutive 429s on the same account/model.
pub const MAX_COOLDOWN_MULTIPLIER: u32 = 8;

/// If every account is cooling down but the oldest cooldown is younger than
/// this, the sticky account is used anyway (brief-blip tolerance).
pub const COOLDOWN_TOLERANCE_SECS: i64 = 120;

/// Access tokens are refreshed when they expire within this window.
pub const TOKEN_REFRESH_SKEW_SECS: i64 = 120;

/// Google OAuth token endpoint used for refresh-token exchanges.
pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const OAUTH_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
pub const OAUTH_CLIENT_SECRET: &str = "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";

/// The gateway config write is rejected unless the system instruction
/// carries this sentence.
pub const SYSTEM_INSTRUCTION_SENTINEL: &str = "You are Antigravity";

/// Ingress guards (validation limits applied during lift).
pub const MAX_HISTORY_LENGTH: usize = 1000;
pub const MAX_MESSAGE_PARTS: usize = 100;
pub const MAX_TOOL_CALLS_PER_REQUEST: usize = 4096;

/// Bound on the process-wide signature cache.
pub const SIGNATURE_CACHE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub family: crate::types::ModelFamily,
    pub thinking: bool,
    pub image: bool,
}

/// Model identifiers the gateway advertises on /v1/models.
pub const KNOWN_MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "gemini-3-pro-preview",
        family: crate::types::ModelFamily::Gemini,
        thinking: true,
        image: false,
    },
    ModelInfo {
        id: "gemini-3-flash",
        family: crate::types::ModelFamily::Gemini,
        thinking: false,
        image: false,
    },
    ModelInfo {
        id: "gemini-2.5-flash",
        family: crate::types::ModelFamily::Gemini,
        thinking: false,
        image: false,
    },
    ModelInfo {
        id: "gemini-3-pro-image-preview",
        family: crate::types::ModelFamily::Gemini,
        thinking: false,
        image: true,
    },
    ModelInfo {
        id: "claude-sonnet-4-5",
        family: crate::types::ModelFamily::Claude,
        thinking: false,
        image: false,
    },
    ModelInfo {
        id: "claude-sonnet-4-5-thinking",
        family: crate::types::ModelFamily::Claude,
        thinking: true,
        image: false,
    },
    ModelInfo {
        id: "claude-opus-4-5-thinking",
        family: crate::types::ModelFamily::Claude,
        thinking: true,
        image: false,
    },
];
