// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Exposes some types from the `pingora` crate, so that typical modules no longer need it as a
//! direct dependency, and defines the session abstraction request filters operate on.

use http::header::{self, AsHeaderName};
use http::{Extensions, HeaderValue, Uri};
pub use pingora::http::{RequestHeader, ResponseHeader};
pub use pingora::proxy::{http_proxy_service, ProxyHttp, Session};
pub use pingora::server::Server;
pub use pingora::upstreams::peer::HttpPeer;
pub use pingora::{Error, ErrorType};
use std::borrow::Cow;
use std::net::SocketAddr;

/// A view of the current HTTP transaction as seen by request filters
///
/// The request header is always present. Response data only becomes available once a response
/// has been written, so during the `logging` phase.
pub trait SessionWrapper: Send {
    /// Returns the request header.
    fn req_header(&self) -> &RequestHeader;

    /// Returns a reference to the associated extensions.
    fn extensions(&self) -> &Extensions;

    /// Returns a mutable reference to the associated extensions.
    fn extensions_mut(&mut self) -> &mut Extensions;

    /// Returns the client (peer) address of the connection if it is an IP address.
    fn client_addr(&self) -> Option<SocketAddr>;

    /// Returns the response header if a response has been written already.
    fn response_written(&self) -> Option<&ResponseHeader>;

    /// Returns the number of response body bytes written so far.
    fn body_bytes_sent(&self) -> usize;

    /// Returns the request URI.
    fn uri(&self) -> &Uri {
        &self.req_header().uri
    }

    /// Returns the value of a request header.
    fn get_header(&self, name: impl AsHeaderName) -> Option<&HeaderValue>
    where
        Self: Sized,
    {
        self.req_header().headers.get(name)
    }

    /// Attempts to determine the request host if one was specified.
    fn host(&self) -> Option<Cow<'_, str>>
    where
        Self: Sized,
    {
        fn host_from_header(session: &impl SessionWrapper) -> Option<Cow<'_, str>> {
            let host = session.get_header(header::HOST)?;
            host.to_str().ok().map(|h| h.into())
        }

        fn host_from_uri(session: &impl SessionWrapper) -> Option<Cow<'_, str>> {
            let uri = session.uri();
            let host = uri.host()?;
            if let Some(port) = uri.port() {
                let mut host = host.to_owned();
                host.push(':');
                host.push_str(port.as_str());
                Some(host.into())
            } else {
                Some(host.into())
            }
        }

        host_from_header(self).or_else(|| host_from_uri(self))
    }
}

/// A session implementation for tests, not backed by any connection
#[derive(Debug)]
pub struct TestSession {
    header: RequestHeader,
    extensions: Extensions,
    client_addr: Option<SocketAddr>,
    response: Option<ResponseHeader>,
    body_bytes_sent: usize,
}

impl From<RequestHeader> for TestSession {
    fn from(header: RequestHeader) -> Self {
        Self {
            header,
            extensions: Extensions::new(),
            client_addr: None,
            response: None,
            body_bytes_sent: 0,
        }
    }
}

impl TestSession {
    /// Sets the client address reported by this session.
    pub fn set_client_addr(&mut self, addr: SocketAddr) {
        self.client_addr = Some(addr);
    }

    /// Simulates writing a response with the given header and body length.
    pub fn set_response(&mut self, header: ResponseHeader, body_bytes_sent: usize) {
        self.response = Some(header);
        self.body_bytes_sent = body_bytes_sent;
    }

    /// Returns a mutable reference to the request header.
    pub fn req_header_mut(&mut self) -> &mut RequestHeader {
        &mut self.header
    }
}

impl SessionWrapper for TestSession {
    fn req_header(&self) -> &RequestHeader {
        &self.header
    }

    fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    fn response_written(&self) -> Option<&ResponseHeader> {
        self.response.as_ref()
    }

    fn body_bytes_sent(&self) -> usize {
        self.body_bytes_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn host_detection() {
        let mut header = RequestHeader::build("GET", b"/", None).unwrap();
        header.insert_header("Host", "example.com:8080").unwrap();
        let session = TestSession::from(header);
        assert_eq!(session.host().as_deref(), Some("example.com:8080"));

        let header = RequestHeader::build("GET", b"/", None).unwrap();
        let session = TestSession::from(header);
        assert_eq!(session.host(), None);
    }

    #[test]
    fn response_data() {
        let header = RequestHeader::build("GET", b"/", None).unwrap();
        let mut session = TestSession::from(header);
        assert!(session.response_written().is_none());
        assert_eq!(session.body_bytes_sent(), 0);

        session.set_response(ResponseHeader::build(404, None).unwrap(), 12);
        assert_eq!(session.response_written().unwrap().status.as_u16(), 404);
        assert_eq!(session.body_bytes_sent(), 12);
    }
}
