//! Plaintext-to-HTTPS upgrade redirects.
//!
//! When TLS is active and a request arrives on a plaintext endpoint, the
//! configured policy may redirect the client to the HTTPS origin: 301 for
//! GET/HEAD, 308 for everything else so the method and body are preserved.
//! The response carries `Vary: Upgrade-Insecure-Requests` and a minimal
//! HTML link body.

use http::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION, VARY};
use http::{HeaderValue, Method, StatusCode};

use crate::body::HookBody;
use crate::types::Response;

/// Request header signalling that the client prefers the secure origin.
pub const UPGRADE_INSECURE_REQUESTS: &str = "upgrade-insecure-requests";

/// A redirect response builder.
pub struct Redirect {
    status: StatusCode,
    location: String,
}

impl Redirect {
    /// Redirect with a custom status code.
    pub fn with_status(location: impl Into<String>, status: StatusCode) -> Self {
        Self {
            status,
            location: location.into(),
        }
    }

    /// 301 Moved Permanently.
    pub fn permanent_moved(location: impl Into<String>) -> Self {
        Self::with_status(location, StatusCode::MOVED_PERMANENTLY)
    }

    /// 308 Permanent Redirect (preserves the HTTP method).
    pub fn permanent(location: impl Into<String>) -> Self {
        Self::with_status(location, StatusCode::PERMANENT_REDIRECT)
    }

    pub fn into_response(self) -> Response {
        let body = format!(
            "<html><body><a href=\"{url}\">{text}</a></body></html>",
            url = self.location,
            text = escape_lt(&self.location),
        );
        let mut res = hyper::Response::new(HookBody::from(body.clone()));
        *res.status_mut() = self.status;
        let headers = res.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&self.location) {
            headers.insert(LOCATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        res
    }
}

/// Builds the upgrade redirect for a plaintext request: 301 for GET/HEAD,
/// 308 otherwise, pointing at `https://<host><target>`.
pub fn upgrade(method: &Method, host: &str, target: &str) -> Response {
    let location = format!("https://{host}{target}");
    let redirect = if matches!(*method, Method::GET | Method::HEAD) {
        Redirect::permanent_moved(location)
    } else {
        Redirect::permanent(location)
    };
    let mut res = redirect.into_response();
    res.headers_mut().insert(
        VARY,
        HeaderValue::from_static("Upgrade-Insecure-Requests"),
    );
    res
}

/// URL-escapes `<` in text displayed inside the redirect body.
fn escape_lt(s: &str) -> String {
    s.replace('<', "%3C")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_redirects_with_301() {
        let res = upgrade(&Method::GET, "www.example", "/page?x=1");
        assert_eq!(res.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            res.headers().get(LOCATION).unwrap(),
            "https://www.example/page?x=1"
        );
        assert_eq!(
            res.headers().get(VARY).unwrap(),
            "Upgrade-Insecure-Requests"
        );
    }

    #[test]
    fn head_redirects_with_301() {
        let res = upgrade(&Method::HEAD, "www.example", "/");
        assert_eq!(res.status(), StatusCode::MOVED_PERMANENTLY);
    }

    #[test]
    fn post_redirects_with_308() {
        let res = upgrade(&Method::POST, "www.example", "/submit");
        assert_eq!(res.status(), StatusCode::PERMANENT_REDIRECT);
    }

    #[test]
    fn displayed_text_escapes_lt() {
        let res = Redirect::permanent_moved("https://h/<script>").into_response();
        let len: usize = res
            .headers()
            .get(CONTENT_LENGTH)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        // href keeps the raw URL; the displayed text has < escaped
        let expected = "<html><body><a href=\"https://h/<script>\">https://h/%3Cscript></a></body></html>";
        assert_eq!(len, expected.len());
    }
}
