use crate::address::Family;

/// Outcome of an IP-query HTTP GET, trimmed down to what the cache needs from it.
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
}

/// HTTP GET collaborator, kept separate from the cache so tests can stub network
/// access entirely. `on_response` fires exactly once per `fetch` call, even on
/// connection failure (synthesized as `status: 0`).
pub trait HttpFetcher: Send + Sync {
    fn fetch(
        &self,
        url: &str,
        family: Family,
        sndbuf: usize,
        rcvbuf: usize,
        on_response: Box<dyn FnOnce(FetchResponse) + Send>,
    );
}

pub struct ReqwestFetcher {
    client_v4: reqwest::Client,
    client_v6: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            client_v4: reqwest::Client::builder().local_address(Some(std::net::IpAddr::V4(
                std::net::Ipv4Addr::UNSPECIFIED,
            ))).build()?,
            client_v6: reqwest::Client::builder().local_address(Some(std::net::IpAddr::V6(
                std::net::Ipv6Addr::UNSPECIFIED,
            ))).build()?,
        })
    }
}

impl HttpFetcher for ReqwestFetcher {
    fn fetch(
        &self,
        url: &str,
        family: Family,
        _sndbuf: usize,
        _rcvbuf: usize,
        on_response: Box<dyn FnOnce(FetchResponse) + Send>,
    ) {
        let client = match family {
            Family::V4 => self.client_v4.clone(),
            Family::V6 => self.client_v6.clone(),
        };
        let url = url.to_owned();
        tokio::task::spawn(async move {
            let response = match client.get(&url).send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    FetchResponse { status, body }
                }
                Err(e) => {
                    tracing::debug!(error = %e, url, "ip query fetch failed");
                    FetchResponse {
                        status: 0,
                        body: String::new(),
                    }
                }
            };
            on_response(response);
        });
    }
}
