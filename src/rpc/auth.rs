//! HTTP basic authentication for node credentials, wired into the
//! `jsonrpsee` client builder.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use jsonrpsee::http_client::{HeaderMap, HeaderValue};

pub(crate) fn build_auth_headers(user: &str, password: &str) -> Result<HeaderMap> {
    if user.contains(':') {
        bail!("rpc user cannot contain ':'");
    }

    let encoded = BASE64_STANDARD.encode(format!("{user}:{password}"));
    let value = HeaderValue::from_str(&format!("Basic {encoded}"))
        .context("failed to build Authorization header")?;

    let mut headers = HeaderMap::new();
    headers.insert("Authorization", value);
    Ok(headers)
}
