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

#![doc = include_str!("../README.md")]

mod app;

use access_log_module::transaction::install_panic_hook;
use access_log_module::{AccessLogConf, AccessLogOpt};
use access_log_utils::pingora::{http_proxy_service, Server};
use access_log_utils::FromYaml;
use clap::Parser;
use log::error;
use serde::Deserialize;
use std::path::PathBuf;

use crate::app::{AccessLogApp, ServerConf, ServerOpt};

/// Run Access Log Server
#[derive(Debug, Parser)]
#[command(version, about)]
struct Opt {
    /// Configuration files to load
    #[clap(long, num_args = 1..)]
    conf: Vec<PathBuf>,

    #[clap(flatten)]
    server: ServerOpt,

    #[clap(flatten)]
    log: AccessLogOpt,
}

/// The configuration of Access Log Server
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Conf {
    #[serde(flatten)]
    server: ServerConf,
    #[serde(flatten)]
    log: AccessLogConf,
}

fn main() {
    env_logger::init();
    install_panic_hook();

    let opt = Opt::parse();

    let mut conf = match Conf::load_from_files(opt.conf.as_slice()) {
        Ok(conf) => conf,
        Err(err) => {
            error!("{err}");
            Conf::default()
        }
    };

    if let Some(env_file) = &opt.log.log_env_file {
        if let Err(err) = conf.log.merge_with_env_file(env_file) {
            error!("{err}");
        }
    }
    conf.server.merge_with_opt(opt.server);
    conf.log.merge_with_opt(opt.log);

    let listen = conf.server.listen_addrs();
    let app = match AccessLogApp::new(conf.server, conf.log) {
        Ok(app) => app,
        Err(err) => {
            error!("{err}");
            return;
        }
    };

    let mut server = match Server::new(None) {
        Ok(server) => server,
        Err(err) => {
            error!("{err}");
            return;
        }
    };
    server.bootstrap();

    let mut proxy = http_proxy_service(&server.configuration, app);
    for addr in &listen {
        proxy.add_tcp(addr);
    }
    server.add_service(proxy);

    server.run_forever();
}

#[cfg(test)]
mod tests {
    use super::*;

    use access_log_module::configuration::SinkKind;
    use test_log::test;

    #[test]
    fn merged_conf() {
        let conf = Conf::from_yaml(
            r#"
listen: ["127.0.0.1:9000"]
upstream: http://127.0.0.1:9001
log_sink: file
log_dir: /tmp/access
log_timeout: 2
"#,
        )
        .unwrap();
        assert_eq!(conf.server.listen_addrs(), vec!["127.0.0.1:9000".to_owned()]);
        assert_eq!(
            conf.server.upstream.as_ref().map(|uri| uri.to_string()),
            Some("http://127.0.0.1:9001/".to_owned())
        );
        assert_eq!(conf.log.log_sink, Some(SinkKind::File));
        assert_eq!(conf.log.log_timeout, 2.0);
    }

    #[test]
    fn command_line() {
        let opt = Opt::parse_from([
            "access-log-server",
            "--conf",
            "a.yaml",
            "b.yaml",
            "--listen",
            "0.0.0.0:8000",
            "--upstream",
            "https://example.com",
            "--log-sink",
            "elasticsearch",
            "--log-tolerance",
            "0.5",
        ]);
        assert_eq!(
            opt.conf,
            vec![PathBuf::from("a.yaml"), PathBuf::from("b.yaml")]
        );

        let mut conf = Conf::default();
        conf.server.merge_with_opt(opt.server);
        conf.log.merge_with_opt(opt.log);
        assert_eq!(conf.server.listen_addrs(), vec!["0.0.0.0:8000".to_owned()]);
        assert!(conf.server.upstream.is_some());
        assert_eq!(conf.log.log_sink, Some(SinkKind::Elasticsearch));
        assert_eq!(conf.log.log_tolerance, Some(0.5));
    }
}
