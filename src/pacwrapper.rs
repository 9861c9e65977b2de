// Serves a rewritten PAC to downstream clients. The served script routes
// everything through this proxy except URLs the upstream PAC would send
// DIRECT; with no upstream PAC known, it always answers DIRECT so that
// nothing gets routed to us pointlessly.
use std::sync::Mutex;

pub const PAC_PATH: &str = "/alpaca.pac";
pub const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

pub struct PacWrapper {
    port: u16,
    state: Mutex<WrapState>,
}

struct WrapState {
    upstream: String,
    wrapped: String,
}

impl PacWrapper {
    pub fn new(port: u16) -> Self {
        let wrapper = PacWrapper {
            port,
            state: Mutex::new(WrapState {
                upstream: String::new(),
                wrapped: String::new(),
            }),
        };
        wrapper.wrap(None);
        wrapper
    }

    /// Installs a new upstream PAC, or clears it with None. The upstream
    /// script is embedded after the return statement, where its own
    /// FindProxyForURL declaration is hoisted and shadows the outer one
    /// for the recursive-looking call.
    pub fn wrap(&self, pacjs: Option<&[u8]>) {
        let upstream = pacjs
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        if upstream == state.upstream && !state.wrapped.is_empty() {
            return;
        }
        state.wrapped = if upstream.is_empty() {
            "// Wrapped for and by alpaca\n\
             function FindProxyForURL(url, host) {\n\
             \x20 return \"DIRECT\";\n\
             }\n"
                .to_string()
        } else {
            format!(
                "// Wrapped for and by alpaca\n\
                 function FindProxyForURL(url, host) {{\n\
                 \x20 return FindProxyForURL(url, host) === \"DIRECT\" ? \"DIRECT\" : \"PROXY localhost:{}\";\n\
                 {}\n\
                 }}\n",
                self.port, upstream
            )
        };
        state.upstream = upstream;
    }

    pub fn pac(&self) -> String {
        self.state.lock().unwrap().wrapped.clone()
    }
}
