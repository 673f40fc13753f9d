use async_trait::async_trait;
use reqwest::{Request, Response};

/// Seam over the HTTP transport so the loader can be exercised without a network.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
