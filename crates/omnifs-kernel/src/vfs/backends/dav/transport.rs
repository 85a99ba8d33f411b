//! WebDAV method layer. URLs are absolute `http`/`https` URIs.

use std::fmt;
use std::io;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::{Method, RequestBuilder, StatusCode};
use tracing::trace;

use super::error::DavError;
use super::xml::{DavResource, PROPFIND_BODY, failed_statuses, parse_multistatus, proppatch_body};
use crate::vfs::uri::Uri;

pub type DavBodyStream = BoxStream<'static, Result<Bytes, DavError>>;
pub type UploadStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
}

impl Depth {
    fn header(self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::One => "1",
        }
    }
}

/// A GET response body.
pub struct DavDownload {
    pub length: Option<u64>,
    pub body: DavBodyStream,
}

#[async_trait]
pub trait DavTransport: Send + Sync + fmt::Debug {
    async fn propfind(&self, url: &Uri, depth: Depth) -> Result<Vec<DavResource>, DavError>;

    async fn get(&self, url: &Uri) -> Result<DavDownload, DavError>;

    async fn put(&self, url: &Uri, body: UploadStream) -> Result<(), DavError>;

    async fn mkcol(&self, url: &Uri) -> Result<(), DavError>;

    async fn delete(&self, url: &Uri) -> Result<(), DavError>;

    async fn copy(&self, from: &Uri, to: &Uri, overwrite: bool) -> Result<(), DavError>;

    async fn move_to(&self, from: &Uri, to: &Uri, overwrite: bool) -> Result<(), DavError>;

    async fn proppatch_modified(&self, url: &Uri, modified: SystemTime) -> Result<(), DavError>;
}

/// Transport over reqwest.
pub struct HttpDavTransport {
    client: reqwest::Client,
    user: Option<String>,
    password: Option<String>,
}

impl fmt::Debug for HttpDavTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDavTransport")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl HttpDavTransport {
    pub fn new(
        user: Option<String>,
        password: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, DavError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("omnifs/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            user,
            password,
        })
    }

    fn request(&self, method: &'static str, url: &Uri) -> Result<RequestBuilder, DavError> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| DavError::Response(format!("method {method}: {e}")))?;
        trace!(%method, url = %url, "dav request");
        let builder = self.client.request(method, url.as_str());
        Ok(match &self.user {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        })
    }

    async fn send(
        &self,
        method: &'static str,
        url: &Uri,
        builder: RequestBuilder,
        ok: &[StatusCode],
    ) -> Result<reqwest::Response, DavError> {
        let response = builder.send().await?;
        let status = response.status();
        if ok.contains(&status) {
            Ok(response)
        } else {
            Err(DavError::status(method, url.as_str(), status.as_u16()))
        }
    }

    async fn transfer(&self, method: &'static str, from: &Uri, to: &Uri, overwrite: bool) -> Result<(), DavError> {
        let builder = self
            .request(method, from)?
            .header("Destination", to.as_str())
            .header("Overwrite", if overwrite { "T" } else { "F" });
        self.send(
            method,
            from,
            builder,
            &[StatusCode::CREATED, StatusCode::NO_CONTENT],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DavTransport for HttpDavTransport {
    async fn propfind(&self, url: &Uri, depth: Depth) -> Result<Vec<DavResource>, DavError> {
        let builder = self
            .request("PROPFIND", url)?
            .header("Depth", depth.header())
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(PROPFIND_BODY);
        let response = self
            .send("PROPFIND", url, builder, &[StatusCode::MULTI_STATUS])
            .await?;
        parse_multistatus(&response.text().await?)
    }

    async fn get(&self, url: &Uri) -> Result<DavDownload, DavError> {
        let builder = self.request("GET", url)?;
        let response = self.send("GET", url, builder, &[StatusCode::OK]).await?;
        Ok(DavDownload {
            length: response.content_length(),
            body: response.bytes_stream().map_err(DavError::from).boxed(),
        })
    }

    async fn put(&self, url: &Uri, body: UploadStream) -> Result<(), DavError> {
        let builder = self
            .request("PUT", url)?
            .body(reqwest::Body::wrap_stream(body));
        self.send(
            "PUT",
            url,
            builder,
            &[StatusCode::OK, StatusCode::CREATED, StatusCode::NO_CONTENT],
        )
        .await?;
        Ok(())
    }

    async fn mkcol(&self, url: &Uri) -> Result<(), DavError> {
        let builder = self.request("MKCOL", url)?;
        self.send("MKCOL", url, builder, &[StatusCode::CREATED]).await?;
        Ok(())
    }

    async fn delete(&self, url: &Uri) -> Result<(), DavError> {
        let builder = self.request("DELETE", url)?;
        self.send(
            "DELETE",
            url,
            builder,
            &[StatusCode::OK, StatusCode::NO_CONTENT],
        )
        .await?;
        Ok(())
    }

    async fn copy(&self, from: &Uri, to: &Uri, overwrite: bool) -> Result<(), DavError> {
        self.transfer("COPY", from, to, overwrite).await
    }

    async fn move_to(&self, from: &Uri, to: &Uri, overwrite: bool) -> Result<(), DavError> {
        self.transfer("MOVE", from, to, overwrite).await
    }

    async fn proppatch_modified(&self, url: &Uri, modified: SystemTime) -> Result<(), DavError> {
        let builder = self
            .request("PROPPATCH", url)?
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(proppatch_body(modified));
        let response = self
            .send("PROPPATCH", url, builder, &[StatusCode::OK, StatusCode::MULTI_STATUS])
            .await?;
        // A 207 can still reject the property.
        match failed_statuses(&response.text().await?)?.first() {
            Some(&status) => Err(DavError::status("PROPPATCH", url.as_str(), status)),
            None => Ok(()),
        }
    }
}
