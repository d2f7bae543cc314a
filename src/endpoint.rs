//! Endpoint directory: workload identity to reachable URL.
//!
//! The only state shared across concurrent requests. Writers are the
//! orchestrator (or the network service in the split topology), readers are
//! the traffic routers. Per-key operations never block each other.

use axum::http::Uri;
use dashmap::DashMap;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct EndpointDirectory {
    endpoints: DashMap<String, Uri>,
}

impl EndpointDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts the endpoint for a workload, overwriting any previous record.
    pub fn store(&self, id: &str, endpoint: Uri) {
        self.endpoints.insert(id.to_owned(), endpoint);
    }

    pub fn load(&self, id: &str) -> Result<Uri> {
        self.endpoints
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::NotFound(id.to_owned()))
    }

    /// Removes the record if present. Absence is not an error.
    pub fn delete(&self, id: &str) {
        self.endpoints.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn load_after_store() {
        let directory = EndpointDirectory::new();
        directory.store("web", uri("http://10.4.0.5:8080/"));
        assert_eq!(directory.load("web").unwrap(), uri("http://10.4.0.5:8080/"));
    }

    #[test]
    fn load_unknown_is_not_found() {
        let directory = EndpointDirectory::new();
        assert!(matches!(directory.load("web"), Err(Error::NotFound(_))));
    }

    #[test]
    fn store_overwrites() {
        let directory = EndpointDirectory::new();
        directory.store("web", uri("http://10.4.0.5:8080/"));
        directory.store("web", uri("http://10.4.0.9:8080/"));
        assert_eq!(directory.load("web").unwrap(), uri("http://10.4.0.9:8080/"));
    }

    #[test]
    fn delete_is_idempotent() {
        let directory = EndpointDirectory::new();
        directory.store("web", uri("http://10.4.0.5:8080/"));
        directory.delete("web");
        directory.delete("web");
        assert!(directory.load("web").is_err());
    }

    #[tokio::test]
    async fn concurrent_mixed_operations() {
        let directory = Arc::new(EndpointDirectory::new());

        let mut handles = Vec::new();
        for i in 0..16 {
            let directory = directory.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("workload-{i}");
                for _ in 0..100 {
                    directory.store(&id, uri("http://10.4.0.5:8080/"));
                    let _ = directory.load(&id);
                    directory.delete(&id);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
