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

//! Pingora proxy application feeding every request through the access log handler

use access_log_module::{AccessLogConf, AccessLogCtx, AccessLogHandler};
use access_log_utils::pingora::{
    Error, ErrorType, HttpPeer, ProxyHttp, RequestHeader, ResponseHeader, Session, SessionWrapper,
};
use access_log_utils::{RequestFilter, RequestFilterResult};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use http::header;
use http::uri::{Scheme, Uri};
use http::Extensions;
use log::{error, info};
use serde::de::{Deserializer, Error as _};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};

/// Command line options of the proxy
#[derive(Debug, Default, Parser)]
pub(crate) struct ServerOpt {
    /// Address to listen on, can be specified multiple times
    #[clap(long)]
    pub(crate) listen: Vec<String>,

    /// http:// or https:// URL of the server that requests should be forwarded to. Path and
    /// query parts of the URL have no effect.
    #[clap(long)]
    pub(crate) upstream: Option<Uri>,
}

fn deserialize_uri<'de, D>(d: D) -> Result<Option<Uri>, D::Error>
where
    D: Deserializer<'de>,
{
    let uri = String::deserialize(d)?;
    let uri = uri
        .parse()
        .map_err(|err| D::Error::custom(format!("URL {uri} could not be parsed: {err}")))?;
    Ok(Some(uri))
}

/// Configuration settings of the proxy
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ServerConf {
    /// Addresses to listen on
    pub(crate) listen: Vec<String>,

    /// Server that requests should be forwarded to
    #[serde(deserialize_with = "deserialize_uri")]
    pub(crate) upstream: Option<Uri>,
}

impl ServerConf {
    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub(crate) fn merge_with_opt(&mut self, opt: ServerOpt) {
        if !opt.listen.is_empty() {
            self.listen = opt.listen;
        }
        if opt.upstream.is_some() {
            self.upstream = opt.upstream;
        }
    }

    /// Addresses to listen on, `127.0.0.1:8080` if none are configured
    pub(crate) fn listen_addrs(&self) -> Vec<String> {
        if self.listen.is_empty() {
            vec!["127.0.0.1:8080".to_owned()]
        } else {
            self.listen.clone()
        }
    }
}

/// Resolved upstream server
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Upstream {
    addr: SocketAddr,
    tls: bool,
    sni: String,
    host_port: String,
}

impl TryFrom<&Uri> for Upstream {
    type Error = Box<Error>;

    fn try_from(upstream: &Uri) -> Result<Self, Self::Error> {
        let scheme = upstream.scheme().ok_or_else(|| {
            Error::explain(
                ErrorType::InternalError,
                format!("provided upstream URL has no scheme: {upstream}"),
            )
        })?;

        let tls = if scheme == &Scheme::HTTP {
            false
        } else if scheme == &Scheme::HTTPS {
            true
        } else {
            return Err(Error::explain(
                ErrorType::InternalError,
                format!("provided upstream URL is neither HTTP nor HTTPS: {upstream}"),
            ));
        };

        let host = upstream.host().ok_or_else(|| {
            Error::explain(
                ErrorType::InternalError,
                format!("provided upstream URL has no host name: {upstream}"),
            )
        })?;

        let port = upstream.port_u16().unwrap_or(if tls { 443 } else { 80 });

        // IPv6 addresses come in brackets
        let sni = host.trim_start_matches('[').trim_end_matches(']');
        let addr = (sni, port)
            .to_socket_addrs()
            .map_err(|err| {
                Error::because(
                    ErrorType::InternalError,
                    format!("failed resolving upstream host name {host}"),
                    err,
                )
            })?
            .next()
            .ok_or_else(|| {
                Error::explain(
                    ErrorType::InternalError,
                    format!("DNS lookup of upstream host name {host} didn't produce any results"),
                )
            })?;

        let mut host_port = host.to_owned();
        if let Some(port) = upstream.port() {
            host_port.push(':');
            host_port.push_str(port.as_str());
        }

        Ok(Self {
            addr,
            tls,
            sni: sni.to_owned(),
            host_port,
        })
    }
}

/// Reverse proxy logging all requests
#[derive(Debug)]
pub(crate) struct AccessLogApp {
    handler: AccessLogHandler,
    upstream: Option<Upstream>,
}

impl AccessLogApp {
    pub(crate) fn new(server: ServerConf, log: AccessLogConf) -> Result<Self, Box<Error>> {
        let upstream = server.upstream.as_ref().map(Upstream::try_from).transpose()?;
        match &upstream {
            Some(upstream) => info!("Forwarding requests to {}", upstream.addr),
            None => error!("No upstream configured, all requests will fail with 404"),
        }

        Ok(Self {
            handler: AccessLogHandler::new(log)?,
            upstream,
        })
    }
}

/// Per-request state of the proxy
#[derive(Debug)]
pub(crate) struct AppCtx {
    extensions: Extensions,
    handler: AccessLogCtx,
}

#[async_trait]
impl ProxyHttp for AccessLogApp {
    type CTX = AppCtx;

    fn new_ctx(&self) -> Self::CTX {
        AppCtx {
            extensions: Extensions::new(),
            handler: AccessLogHandler::new_ctx(),
        }
    }

    async fn request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<bool, Box<Error>> {
        let mut session = SessionWrapperImpl::new(session, &mut ctx.extensions);
        Ok(self
            .handler
            .request_filter(&mut session, &mut ctx.handler)
            .await?
            == RequestFilterResult::ResponseSent)
    }

    async fn request_body_filter(
        &self,
        session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<(), Box<Error>> {
        let mut session = SessionWrapperImpl::new(session, &mut ctx.extensions);
        self.handler
            .request_body_filter(&mut session, body.as_ref(), end_of_stream, &mut ctx.handler)
            .await
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>, Box<Error>> {
        if let Some(upstream) = &self.upstream {
            Ok(Box::new(HttpPeer::new(
                upstream.addr,
                upstream.tls,
                upstream.sni.clone(),
            )))
        } else {
            Err(Error::new(ErrorType::HTTPStatus(404)))
        }
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        _ctx: &mut Self::CTX,
    ) -> Result<(), Box<Error>> {
        if let Some(upstream) = &self.upstream {
            upstream_request.insert_header(header::HOST, &upstream.host_port)?;
        }
        Ok(())
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let mut session = SessionWrapperImpl::new(session, &mut ctx.extensions);
        self.handler
            .logging(&mut session, e, &mut ctx.handler)
            .await
    }
}

/// Exposes a Pingora session to the access log handler
struct SessionWrapperImpl<'a> {
    inner: &'a mut Session,
    extensions: &'a mut Extensions,
}

impl<'a> SessionWrapperImpl<'a> {
    fn new(inner: &'a mut Session, extensions: &'a mut Extensions) -> Self {
        Self { inner, extensions }
    }
}

impl SessionWrapper for SessionWrapperImpl<'_> {
    fn req_header(&self) -> &RequestHeader {
        self.inner.req_header()
    }

    fn extensions(&self) -> &Extensions {
        self.extensions
    }

    fn extensions_mut(&mut self) -> &mut Extensions {
        self.extensions
    }

    fn client_addr(&self) -> Option<SocketAddr> {
        self.inner
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .copied()
    }

    fn response_written(&self) -> Option<&ResponseHeader> {
        self.inner.response_written()
    }

    fn body_bytes_sent(&self) -> usize {
        self.inner.body_bytes_sent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use access_log_module::identifier::DocumentId;
    use access_log_module::sink::{REQUEST_FILE, RESPONSE_FILE};
    use access_log_utils::FromYaml;
    use serde_json::{json, Value};
    use std::io::{Cursor, Seek, SeekFrom, Write};
    use std::path::Path;
    use test_log::test;

    async fn make_session(mut header: RequestHeader, body: &str) -> Session {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let _ = cursor.write(b"POST / HTTP/1.1\r\n");
        let _ = cursor.write(b"Connection: close\r\n");
        let _ = cursor.write(b"\r\n");
        let _ = cursor.write(body.as_bytes());
        let _ = cursor.seek(SeekFrom::Start(0));

        let _ = header.insert_header(header::CONTENT_LENGTH, body.len());

        let mut session = Session::new_h1(Box::new(cursor));
        assert!(session.read_request().await.unwrap());
        *session.req_header_mut() = header;

        session
    }

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn upstream_resolution() {
        let upstream = Upstream::try_from(&Uri::from_static("http://127.0.0.1:8081/ignored"))
            .unwrap();
        assert_eq!(upstream.addr, "127.0.0.1:8081".parse().unwrap());
        assert!(!upstream.tls);
        assert_eq!(upstream.sni, "127.0.0.1");
        assert_eq!(upstream.host_port, "127.0.0.1:8081");

        let upstream = Upstream::try_from(&Uri::from_static("https://[::1]")).unwrap();
        assert_eq!(upstream.addr, "[::1]:443".parse().unwrap());
        assert!(upstream.tls);
        assert_eq!(upstream.sni, "::1");
        assert_eq!(upstream.host_port, "[::1]");

        assert!(Upstream::try_from(&Uri::from_static("ftp://127.0.0.1")).is_err());
        assert!(Upstream::try_from(&Uri::from_static("/relative")).is_err());
    }

    #[test]
    fn listen_defaults() {
        let mut conf = ServerConf::default();
        assert_eq!(conf.listen_addrs(), vec!["127.0.0.1:8080".to_owned()]);

        conf.merge_with_opt(ServerOpt {
            listen: vec!["[::1]:9000".to_owned()],
            upstream: None,
        });
        assert_eq!(conf.listen_addrs(), vec!["[::1]:9000".to_owned()]);
    }

    #[test]
    fn app_without_sink() {
        let app = AccessLogApp::new(
            ServerConf {
                listen: Vec::new(),
                upstream: Some(Uri::from_static("http://127.0.0.1:8081")),
            },
            AccessLogConf::default(),
        )
        .unwrap();
        assert!(!app.handler.is_enabled());
        assert!(app.upstream.is_some());
    }

    #[test(tokio::test)]
    async fn request_body_logged() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AccessLogConf::from_yaml(format!(
            "log_sink: file\nlog_dir: {}\nlog_id_header: X-Request-Id",
            tmp.path().display()
        ))
        .unwrap();
        let app = AccessLogApp::new(ServerConf::default(), log).unwrap();

        let body = "name=value&list=1&list=2";
        let mut header = RequestHeader::build("POST", b"/form", None).unwrap();
        header.insert_header("Host", "example.com").unwrap();
        header.insert_header("X-Request-Id", "proxied").unwrap();
        header
            .insert_header("Content-Type", "application/x-www-form-urlencoded")
            .unwrap();
        let mut session = make_session(header, body).await;
        let mut ctx = app.new_ctx();

        assert!(!app.request_filter(&mut session, &mut ctx).await.unwrap());

        let mut chunk = Some(Bytes::from(body));
        app.request_body_filter(&mut session, &mut chunk, true, &mut ctx)
            .await
            .unwrap();
        assert_eq!(chunk, Some(Bytes::from(body)));

        let err = app.upstream_peer(&mut session, &mut ctx).await.err().unwrap();
        app.logging(&mut session, Some(&err), &mut ctx).await;

        let dir = tmp.path().join(DocumentId::generate(Some("proxied")).as_str());
        let request = &read_lines(&dir.join(REQUEST_FILE))[0];
        assert_eq!(request["method"], "POST");
        assert_eq!(request["url"]["uri"], "/form");
        assert_eq!(request["post"], json!({"name": "value", "list": ["1", "2"]}));
        assert_eq!(request["rawpost"], body);

        let response = &read_lines(&dir.join(RESPONSE_FILE))[0];
        assert_eq!(response["error"][0][0], 404);
    }
}
