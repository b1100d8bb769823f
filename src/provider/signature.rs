//! Carrier webhook signature verification: base64(HMAC-SHA1) over the
//! public URL plus the sorted form body, with the URL reconstructed
//! through whatever reverse proxy or tunnel fronted the request.

use super::WebhookRequest;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;

pub const SIGNATURE_HEADER: &str = "X-Twilio-Signature";

/// Host headers consulted when no explicit public URL is configured,
/// most specific first.
const HOST_HEADERS: [&str; 4] = [
    "x-forwarded-host",
    "x-original-host",
    "ngrok-forwarded-host",
    "host",
];

#[derive(Debug, Clone, Default)]
pub struct VerifyOutcome {
    pub ok: bool,
    pub reason: Option<String>,
    /// The URL the signature was checked against.
    pub url: Option<String>,
    /// Set when verification failed behind an ngrok free-tier hostname,
    /// which rewrites requests in ways that break signing.
    pub ngrok_free_tier: bool,
}

impl VerifyOutcome {
    fn rejected(reason: &str, url: Option<String>) -> Self {
        let ngrok_free_tier = url.as_deref().map(is_ngrok_free_tier).unwrap_or(false);
        Self {
            ok: false,
            reason: Some(reason.to_string()),
            url,
            ngrok_free_tier,
        }
    }
}

/// Compute the carrier's signature for a URL and decoded form pairs:
/// the signed string is the URL followed by every `key` + `value`
/// concatenation in ascending key order.
pub fn compute_signature(auth_token: &str, url: &str, form_pairs: &[(String, String)]) -> String {
    BASE64.encode(hmac_for(auth_token, url, form_pairs).finalize().into_bytes())
}

fn hmac_for(auth_token: &str, url: &str, form_pairs: &[(String, String)]) -> Hmac<Sha1> {
    let mut sorted: Vec<&(String, String)> = form_pairs.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut signed = String::from(url);
    for (key, value) in sorted {
        signed.push_str(key);
        signed.push_str(value);
    }

    let mut mac =
        Hmac::<Sha1>::new_from_slice(auth_token.as_bytes()).expect("hmac accepts any key length");
    mac.update(signed.as_bytes());
    mac
}

pub fn verify(
    request: &WebhookRequest,
    auth_token: &str,
    override_public_url: Option<&str>,
) -> VerifyOutcome {
    let url = match reconstruct_url(request, override_public_url) {
        Some(url) => url,
        None => return VerifyOutcome::rejected("no host header to reconstruct the URL from", None),
    };

    let provided = match request.header(SIGNATURE_HEADER) {
        Some(sig) => sig,
        None => return VerifyOutcome::rejected("missing signature header", Some(url)),
    };
    let provided = match BASE64.decode(provided) {
        Ok(bytes) => bytes,
        Err(_) => return VerifyOutcome::rejected("signature is not valid base64", Some(url)),
    };

    let mac = hmac_for(auth_token, &url, &request.form_pairs());
    match mac.verify_slice(&provided) {
        Ok(()) => VerifyOutcome {
            ok: true,
            reason: None,
            url: Some(url),
            ngrok_free_tier: false,
        },
        Err(_) => VerifyOutcome::rejected("signature mismatch", Some(url)),
    }
}

/// Rebuild the URL the carrier signed. An explicit public URL wins;
/// otherwise trust the forwarding headers, dropping any port since the
/// carrier signs against the public hostname.
fn reconstruct_url(request: &WebhookRequest, override_public_url: Option<&str>) -> Option<String> {
    if let Some(configured) = override_public_url {
        if let Ok(parsed) = reqwest::Url::parse(configured) {
            return Some(format!(
                "{}{}",
                parsed.origin().ascii_serialization(),
                request.path_and_query
            ));
        }
    }

    let proto = request.header("x-forwarded-proto").unwrap_or("https");
    let host = HOST_HEADERS.iter().find_map(|h| request.header(h))?;
    let host = host.split(':').next().unwrap_or(host);
    Some(format!("{}://{}{}", proto, host, request.path_and_query))
}

fn is_ngrok_free_tier(url: &str) -> bool {
    let host = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url)
        .split('/')
        .next()
        .unwrap_or("");
    host.ends_with(".ngrok-free.app") || host.ends_with(".ngrok.io")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    const TOKEN: &str = "test-auth-token";

    fn signed_request(url: &str, path_and_query: &str, body: &str, host: &str) -> WebhookRequest {
        let mut request = WebhookRequest {
            path_and_query: path_and_query.to_string(),
            headers: HeaderMap::new(),
            body: body.to_string(),
        };
        let signature = compute_signature(TOKEN, url, &request.form_pairs());
        request
            .headers
            .insert(SIGNATURE_HEADER, signature.parse().unwrap());
        request.headers.insert("host", host.parse().unwrap());
        request
    }

    #[test]
    fn test_valid_signature_accepted() {
        let request = signed_request(
            "https://calls.example.com/voice/webhook?callId=c1",
            "/voice/webhook?callId=c1",
            "CallSid=CA1&CallStatus=ringing",
            "calls.example.com",
        );
        let outcome = verify(&request, TOKEN, None);
        assert!(outcome.ok, "rejected: {:?}", outcome.reason);
        assert_eq!(
            outcome.url.as_deref(),
            Some("https://calls.example.com/voice/webhook?callId=c1")
        );
    }

    #[test]
    fn test_body_order_does_not_matter() {
        let url = "https://calls.example.com/voice/webhook";
        let ordered = signed_request(url, "/voice/webhook", "A=1&B=2&C=3", "calls.example.com");
        let signature = ordered.header(SIGNATURE_HEADER).unwrap().to_string();

        let mut shuffled = WebhookRequest {
            path_and_query: "/voice/webhook".to_string(),
            headers: HeaderMap::new(),
            body: "C=3&A=1&B=2".to_string(),
        };
        shuffled
            .headers
            .insert(SIGNATURE_HEADER, signature.parse().unwrap());
        shuffled
            .headers
            .insert("host", "calls.example.com".parse().unwrap());

        assert!(verify(&shuffled, TOKEN, None).ok);
    }

    #[test]
    fn test_wrong_token_rejected() {
        let request = signed_request(
            "https://calls.example.com/voice/webhook",
            "/voice/webhook",
            "CallSid=CA1",
            "calls.example.com",
        );
        let outcome = verify(&request, "other-token", None);
        assert!(!outcome.ok);
        assert!(!outcome.ngrok_free_tier);
    }

    #[test]
    fn test_tampered_body_rejected() {
        let mut request = signed_request(
            "https://calls.example.com/voice/webhook",
            "/voice/webhook",
            "CallSid=CA1&CallStatus=ringing",
            "calls.example.com",
        );
        request.body = "CallSid=CA1&CallStatus=completed".to_string();
        assert!(!verify(&request, TOKEN, None).ok);
    }

    #[test]
    fn test_override_public_url_wins_over_host_header() {
        let request = {
            let mut r = signed_request(
                "https://public.example.net/voice/webhook",
                "/voice/webhook",
                "CallSid=CA1",
                "internal-host:3334",
            );
            // Signature was computed against the public origin, not the
            // internal host the proxy delivers to.
            r.headers.remove("host");
            r.headers.insert("host", "127.0.0.1:3334".parse().unwrap());
            r
        };
        assert!(!verify(&request, TOKEN, None).ok);
        let outcome = verify(&request, TOKEN, Some("https://public.example.net"));
        assert!(outcome.ok, "rejected: {:?}", outcome.reason);
    }

    #[test]
    fn test_forwarded_host_preferred_and_port_stripped() {
        let mut request = signed_request(
            "https://edge.example.org/voice/webhook",
            "/voice/webhook",
            "CallSid=CA1",
            "10.0.0.5:8080",
        );
        request
            .headers
            .insert("x-forwarded-host", "edge.example.org:443".parse().unwrap());
        request
            .headers
            .insert("x-forwarded-proto", "https".parse().unwrap());
        let outcome = verify(&request, TOKEN, None);
        assert!(outcome.ok, "rejected: {:?}", outcome.reason);
    }

    #[test]
    fn test_ngrok_free_tier_flagged_on_mismatch() {
        let mut request = signed_request(
            "https://abc123.ngrok-free.app/voice/webhook",
            "/voice/webhook",
            "CallSid=CA1",
            "abc123.ngrok-free.app",
        );
        request.body = "CallSid=CA2".to_string();
        let outcome = verify(&request, TOKEN, None);
        assert!(!outcome.ok);
        assert!(outcome.ngrok_free_tier);
    }

    #[test]
    fn test_missing_signature_header() {
        let mut request = WebhookRequest {
            path_and_query: "/voice/webhook".to_string(),
            headers: HeaderMap::new(),
            body: String::new(),
        };
        request.headers.insert("host", "x.example.com".parse().unwrap());
        let outcome = verify(&request, TOKEN, None);
        assert!(!outcome.ok);
        assert_eq!(outcome.reason.as_deref(), Some("missing signature header"));
    }
}
