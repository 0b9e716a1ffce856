// Split by surface: core state/router, the two pipeline entry points, then the
// non-proxied JSON endpoints and the websocket.
include!("http/core.rs");
include!("http/chat_completions.rs");
include!("http/proxy.rs");
include!("http/conversations.rs");
include!("http/usage.rs");
include!("http/chat_ws.rs");
