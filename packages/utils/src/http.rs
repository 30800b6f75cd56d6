pub mod auth {
    use axum::{
        body::Body,
        extract::{Request, State},
        http::{header, Response, StatusCode},
        middleware::Next,
        response::IntoResponse,
    };

    /// Pulls the presented API key out of a request, accepting any of:
    /// `Authorization: Bearer <key>`, an `x-api-key` header, or an
    /// `api_key` query parameter.
    pub fn presented_api_key(req: &Request) -> Option<String> {
        if let Some(value) = req.headers().get(header::AUTHORIZATION) {
            if let Ok(s) = value.to_str() {
                if let Some(token) = s.strip_prefix("Bearer ") {
                    return Some(token.to_string());
                }
            }
        }

        if let Some(value) = req.headers().get("x-api-key") {
            if let Ok(s) = value.to_str() {
                return Some(s.to_string());
            }
        }

        req.uri().query().and_then(|query| {
            query.split('&').find_map(|pair| {
                pair.strip_prefix("api_key=")
                    .map(|v| v.to_string())
                    .filter(|v| !v.is_empty())
            })
        })
    }

    // Shared master-key middleware with realm support
    // State is a tuple: (master key, realm)
    pub async fn verify_master_key_with_realm(
        State((master_key, realm)): State<(String, String)>,
        req: Request,
        next: Next,
    ) -> impl IntoResponse {
        let unauthorized = || {
            Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header(
                    header::WWW_AUTHENTICATE,
                    format!("Bearer realm=\"{}\"", realm),
                )
                .body(Body::from("Unauthorized"))
                .unwrap()
        };

        match presented_api_key(&req) {
            Some(key) if key == master_key => next.run(req).await,
            _ => unauthorized(),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use axum::http::Request as HttpRequest;

        fn request(uri: &str, headers: &[(&str, &str)]) -> Request {
            let mut builder = HttpRequest::builder().uri(uri);
            for (name, value) in headers {
                builder = builder.header(*name, *value);
            }
            builder.body(Body::empty()).unwrap()
        }

        #[test]
        fn bearer_header_wins() {
            let req = request(
                "/tools?api_key=from-query",
                &[("authorization", "Bearer from-bearer")],
            );
            assert_eq!(presented_api_key(&req).as_deref(), Some("from-bearer"));
        }

        #[test]
        fn x_api_key_and_query_fallbacks() {
            let req = request("/tools", &[("x-api-key", "from-header")]);
            assert_eq!(presented_api_key(&req).as_deref(), Some("from-header"));

            let req = request("/tools?limit=5&api_key=from-query", &[]);
            assert_eq!(presented_api_key(&req).as_deref(), Some("from-query"));

            let req = request("/tools", &[]);
            assert_eq!(presented_api_key(&req), None);
        }
    }
}
