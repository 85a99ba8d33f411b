//! PROPFIND/PROPPATCH bodies and multistatus parsing.

use std::time::SystemTime;

use quick_xml::Reader;
use quick_xml::events::Event;

use super::error::DavError;
use crate::vfs::uri::{Uri, percent_decode};

/// Request body asking for the properties we translate.
pub const PROPFIND_BODY: &str = concat!(
    r#"<?xml version="1.0" encoding="utf-8"?>"#,
    r#"<d:propfind xmlns:d="DAV:"><d:prop>"#,
    "<d:resourcetype/><d:getcontentlength/><d:getlastmodified/>",
    "<d:getcontenttype/><d:creationdate/><d:getetag/>",
    "</d:prop></d:propfind>"
);

/// One `<response>` of a multistatus body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DavResource {
    /// Decoded path of the resource, without a trailing slash.
    pub path: Vec<u8>,
    pub is_collection: bool,
    pub size: Option<u64>,
    pub modified: Option<SystemTime>,
    pub created: Option<SystemTime>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
}

pub fn http_date(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

pub fn proppatch_body(modified: SystemTime) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<d:propertyupdate xmlns:d="DAV:"><d:set><d:prop>"#,
            "<d:getlastmodified>{}</d:getlastmodified>",
            "</d:prop></d:set></d:propertyupdate>"
        ),
        http_date(modified)
    )
}

/// Decoded path of an href, which may be an absolute URL or an absolute
/// path.
pub fn href_path(href: &str) -> Result<Vec<u8>, DavError> {
    let encoded = if href.starts_with('/') {
        href.split(['?', '#']).next().unwrap_or(href).to_string()
    } else {
        Uri::parse(href)
            .map_err(|e| DavError::Response(format!("bad href {href:?}: {e}")))?
            .encoded_path()
            .to_string()
    };
    let mut path = percent_decode(&encoded)
        .map_err(|e| DavError::Response(format!("bad href {href:?}: {e}")))?;
    while path.len() > 1 && path.last() == Some(&b'/') {
        path.pop();
    }
    if path.is_empty() {
        path.push(b'/');
    }
    Ok(path)
}

fn parse_time(text: &str) -> Option<SystemTime> {
    chrono::DateTime::parse_from_rfc2822(text)
        .or_else(|_| chrono::DateTime::parse_from_rfc3339(text))
        .ok()
        .map(Into::into)
}

fn status_ok(line: &str) -> bool {
    line.split_whitespace()
        .nth(1)
        .is_some_and(|code| code.starts_with('2'))
}

#[derive(Default)]
struct Props {
    is_collection: bool,
    size: Option<u64>,
    modified: Option<SystemTime>,
    created: Option<SystemTime>,
    content_type: Option<String>,
    etag: Option<String>,
}

impl Props {
    fn apply_to(self, resource: &mut DavResource) {
        resource.is_collection |= self.is_collection;
        resource.size = resource.size.or(self.size);
        resource.modified = resource.modified.or(self.modified);
        resource.created = resource.created.or(self.created);
        resource.content_type = resource.content_type.take().or(self.content_type);
        resource.etag = resource.etag.take().or(self.etag);
    }
}

/// Parse a 207 multistatus body. Properties from non-2xx propstats are
/// ignored; a response whose own status is not 2xx is dropped.
pub fn parse_multistatus(body: &str) -> Result<Vec<DavResource>, DavError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut resources = Vec::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut current: Option<(DavResource, bool)> = None;
    let mut props = Props::default();
    let mut propstat_status: Option<String> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| DavError::Response(format!("xml: {e}")))?;
        match event {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_ascii_lowercase();
                match name.as_slice() {
                    b"response" => current = Some((DavResource::default(), true)),
                    b"propstat" => {
                        props = Props::default();
                        propstat_status = None;
                    }
                    b"collection" if stack.last().is_some_and(|n| n == b"resourcetype") => {
                        props.is_collection = true;
                    }
                    _ => {}
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                let name = e.local_name().as_ref().to_ascii_lowercase();
                if name == b"collection" && stack.last().is_some_and(|n| n == b"resourcetype") {
                    props.is_collection = true;
                }
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| DavError::Response(format!("xml text: {e}")))?;
                let text = text.trim();
                let Some(element) = stack.last() else {
                    continue;
                };
                let in_propstat = stack.iter().any(|n| n == b"propstat");
                match element.as_slice() {
                    b"href" if !in_propstat => {
                        if let Some((resource, _)) = current.as_mut() {
                            resource.path = href_path(text)?;
                        }
                    }
                    b"status" if in_propstat => propstat_status = Some(text.to_string()),
                    b"status" => {
                        if let Some((_, ok)) = current.as_mut() {
                            *ok = status_ok(text);
                        }
                    }
                    b"getcontentlength" => props.size = text.parse().ok(),
                    b"getlastmodified" => props.modified = parse_time(text),
                    b"creationdate" => props.created = parse_time(text),
                    b"getcontenttype" => props.content_type = Some(text.to_string()),
                    b"getetag" => props.etag = Some(text.to_string()),
                    _ => {}
                }
            }
            Event::End(e) => {
                let name = e.local_name().as_ref().to_ascii_lowercase();
                match name.as_slice() {
                    b"propstat" => {
                        let ok = propstat_status.as_deref().is_none_or(status_ok);
                        let done = std::mem::take(&mut props);
                        if let (true, Some((resource, _))) = (ok, current.as_mut()) {
                            done.apply_to(resource);
                        }
                    }
                    b"response" => {
                        if let Some((resource, true)) = current.take() {
                            if !resource.path.is_empty() {
                                resources.push(resource);
                            }
                        }
                    }
                    _ => {}
                }
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(resources)
}

/// Non-2xx status codes anywhere in a multistatus body.
pub fn failed_statuses(body: &str) -> Result<Vec<u16>, DavError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);
    let mut in_status = false;
    let mut failed = Vec::new();
    loop {
        match reader
            .read_event()
            .map_err(|e| DavError::Response(format!("xml: {e}")))?
        {
            Event::Start(e) => in_status = e.local_name().as_ref().eq_ignore_ascii_case(b"status"),
            Event::End(_) => in_status = false,
            Event::Text(t) if in_status => {
                let text = t
                    .unescape()
                    .map_err(|e| DavError::Response(format!("xml text: {e}")))?;
                if !status_ok(&text) {
                    let code = text.split_whitespace().nth(1).and_then(|c| c.parse().ok());
                    failed.push(code.unwrap_or(500));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/files/</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype><D:collection/></D:resourcetype>
        <D:getlastmodified>Tue, 02 Jan 2024 03:04:05 GMT</D:getlastmodified>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>http://server.example/files/My%20Report.txt</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype/>
        <D:getcontentlength>1024</D:getcontentlength>
        <D:getcontenttype>text/plain</D:getcontenttype>
        <D:getetag>"abc"</D:getetag>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
    <D:propstat>
      <D:prop><D:creationdate/></D:prop>
      <D:status>HTTP/1.1 404 Not Found</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/files/gone</D:href>
    <D:status>HTTP/1.1 404 Not Found</D:status>
  </D:response>
</D:multistatus>"#;

    #[test]
    fn test_parse_multistatus() {
        let resources = parse_multistatus(LISTING).unwrap();
        assert_eq!(resources.len(), 2);

        assert_eq!(resources[0].path, b"/files");
        assert!(resources[0].is_collection);
        assert_eq!(
            resources[0].modified.map(http_date).as_deref(),
            Some("Tue, 02 Jan 2024 03:04:05 GMT")
        );

        assert_eq!(resources[1].path, b"/files/My Report.txt");
        assert!(!resources[1].is_collection);
        assert_eq!(resources[1].size, Some(1024));
        assert_eq!(resources[1].content_type.as_deref(), Some("text/plain"));
        assert_eq!(resources[1].etag.as_deref(), Some("\"abc\""));
        assert_eq!(resources[1].created, None);
    }

    #[test]
    fn test_href_path() {
        assert_eq!(href_path("/").unwrap(), b"/");
        assert_eq!(href_path("/a/b/").unwrap(), b"/a/b");
        assert_eq!(href_path("https://h:8443/x%2Fy?q=1").unwrap(), b"/x/y");
    }

    #[test]
    fn test_malformed_body() {
        assert!(parse_multistatus("<multistatus><response></multistatus>").is_err());
    }

    #[test]
    fn test_failed_statuses() {
        let body = r#"<d:multistatus xmlns:d="DAV:"><d:response><d:href>/a</d:href>
            <d:propstat><d:prop><d:getlastmodified/></d:prop>
            <d:status>HTTP/1.1 403 Forbidden</d:status></d:propstat></d:response></d:multistatus>"#;
        assert_eq!(failed_statuses(body).unwrap(), vec![403]);
        assert!(failed_statuses(LISTING).unwrap().contains(&404));
    }

    #[test]
    fn test_proppatch_body_carries_http_date() {
        let time = SystemTime::UNIX_EPOCH;
        assert!(proppatch_body(time).contains("Thu, 01 Jan 1970 00:00:00 GMT"));
    }
}
