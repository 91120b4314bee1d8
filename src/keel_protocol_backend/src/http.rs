use candid::CandidType;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(CandidType, Clone, Debug, Deserialize, Serialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: ByteBuf,
}

impl HttpRequest {
    /// The URL with the query string stripped.
    pub fn path(&self) -> &str {
        match self.url.find('?') {
            None => &self.url[..],
            Some(index) => &self.url[..index],
        }
    }

    /// Returns the value of the first occurrence of the given query
    /// parameter, or `None` if it does not appear in the query string.
    pub fn raw_query_param(&self, param: &str) -> Option<&str> {
        let query_string = self.url.split('?').nth(1)?;
        for chunk in query_string.split('&') {
            let mut split = chunk.splitn(2, '=');
            if split.next()? == param {
                return Some(split.next().unwrap_or_default());
            }
        }
        None
    }
}

#[derive(CandidType, Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: ByteBuf,
}

pub struct HttpResponseBuilder(HttpResponse);

impl HttpResponseBuilder {
    pub fn ok() -> Self {
        Self(HttpResponse {
            status_code: 200,
            headers: vec![],
            body: ByteBuf::default(),
        })
    }

    pub fn bad_request() -> Self {
        Self(HttpResponse {
            status_code: 400,
            headers: vec![],
            body: ByteBuf::from("bad request"),
        })
    }

    pub fn not_found() -> Self {
        Self(HttpResponse {
            status_code: 404,
            headers: vec![],
            body: ByteBuf::from("not found"),
        })
    }

    pub fn server_error(reason: impl ToString) -> Self {
        Self(HttpResponse {
            status_code: 500,
            headers: vec![],
            body: ByteBuf::from(reason.to_string()),
        })
    }

    pub fn header(mut self, name: impl ToString, value: impl ToString) -> Self {
        self.0.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body_and_content_length(mut self, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        self = self.header("Content-Length", body.len());
        self.0.body = ByteBuf::from(body);
        self
    }

    pub fn build(self) -> HttpResponse {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".to_string(),
            url: url.to_string(),
            headers: vec![],
            body: ByteBuf::default(),
        }
    }

    #[test]
    fn path_strips_the_query_string() {
        assert_eq!(request("/logs?time=5").path(), "/logs");
        assert_eq!(request("/dashboard").path(), "/dashboard");
    }

    #[test]
    fn query_params_are_found_by_name() {
        let req = request("/logs?time=5&priority=debug");
        assert_eq!(req.raw_query_param("time"), Some("5"));
        assert_eq!(req.raw_query_param("priority"), Some("debug"));
        assert_eq!(req.raw_query_param("missing"), None);
        assert_eq!(request("/logs").raw_query_param("time"), None);
    }
}
