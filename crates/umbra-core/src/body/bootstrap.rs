//! Runtime bootstrap injected into rewritten documents and scripts.

use serde::Serialize;

use crate::config::{ProxyConfig, RuntimeScripts};

/// Marker present in every injected bootstrap.
pub const BOOTSTRAP_MARKER: &str = "__umbra$bootstrap";

/// Global the client runtime defines once it has loaded.
pub const RUNTIME_GLOBAL: &str = "__umbra";

/// Data handed to the client runtime.
#[derive(Debug, Clone, Serialize)]
pub struct Bootstrap {
    /// Client view of the active configuration.
    pub config: serde_json::Value,
    /// Relay endpoint this page talks to.
    pub relay: String,
    /// Cookie payload (a JSON array) for the current URL.
    #[serde(serialize_with = "raw_json")]
    pub cookies: String,
    /// Real referrer of the page.
    pub referrer: Option<String>,
    #[serde(skip)]
    pub scripts: RuntimeScripts,
}

fn raw_json<S: serde::Serializer>(value: &str, serializer: S) -> Result<S::Ok, S::Error> {
    let parsed: serde_json::Value =
        serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::Array(Vec::new()));
    parsed.serialize(serializer)
}

impl Bootstrap {
    pub fn new(config: &ProxyConfig, relay: impl Into<String>) -> Self {
        Self {
            config: config.client_view(),
            relay: relay.into(),
            cookies: "[]".to_string(),
            referrer: None,
            scripts: config.scripts.clone(),
        }
    }

    pub fn with_cookies(mut self, cookies: String) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn with_referrer(mut self, referrer: Option<String>) -> Self {
        self.referrer = referrer;
        self
    }

    fn data_assignment(&self) -> String {
        format!("self.{BOOTSTRAP_MARKER} = {};", script_safe_json(self))
    }

    /// Markup inserted into a document head.
    pub fn html(&self) -> String {
        let mut out = format!(
            "<script data-umbra-bootstrap>{}</script>",
            self.data_assignment()
        );
        for src in self.scripts.in_load_order() {
            out.push_str("<script src=\"");
            out.push_str(&html_escape::encode_double_quoted_attribute(src));
            out.push_str("\"></script>");
        }
        out
    }

    /// Block prepended to scripts and workers that may run without the runtime.
    pub fn worker(&self) -> String {
        let imports = self
            .scripts
            .in_load_order()
            .iter()
            .map(|src| script_safe_json(src))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "if (!self.{RUNTIME_GLOBAL} && self.importScripts) {{\n    {}\n    importScripts({imports});\n}}\n",
            self.data_assignment()
        )
    }
}

/// Serializes to JSON that is safe inside an inline `<script>`.
pub fn script_safe_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "null".to_string())
        .replace('<', "\\u003c")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}
