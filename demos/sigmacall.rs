// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_json::Value;

use sigmap_session::config::ClntConfig;
use sigmap_session::protocol::{FcallType, Fence, Tmsg};
use sigmap_session::sessmgr::SessionMgr;

static APP: &'static str = "sigmacall";
static DEFAULT_ADDRS: &'static str = "127.0.0.1:2040";

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making one SigmaP RPC")
        .version(crate_version!())
        .arg(
            Arg::with_name("addrs")
                .help("Comma-separated candidate addresses, tried in order")
                .long("addrs")
                .short("a")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("type")
                .help("Request type: attach, walk, read, write")
                .long("type")
                .short("t")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON-encoded request payload")
                .long("args")
                .takes_value(true)
                .required(true),
        )
        .get_matches()
}

fn request_type(name: &str) -> Option<FcallType> {
    match name {
        "attach" => Some(FcallType::Tattach),
        "walk" => Some(FcallType::Twalk),
        "read" => Some(FcallType::Tread),
        "write" => Some(FcallType::Twrite),
        _ => None,
    }
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let addrs: Vec<SocketAddr> = matches
        .value_of("addrs")
        .unwrap_or(DEFAULT_ADDRS)
        .split(',')
        .map(|a| a.trim().parse::<SocketAddr>())
        .collect::<Result<_, _>>()
        .unwrap_or_else(|e| {
            eprintln!("Failed to parse address list: {}", e);
            process::exit(1)
        });
    let ty = request_type(matches.value_of("type").unwrap_or(""))
        .unwrap_or_else(|| {
            eprintln!("Unsupported request type");
            process::exit(1)
        });
    let args = value_t!(matches, "args", Value).unwrap_or_else(|e| e.exit());

    let cfg = ClntConfig {
        heartbeat_idle_ms: None,
        ..ClntConfig::default()
    };
    let mgr = SessionMgr::new(cfg, None);
    match mgr.rpc(&addrs, Tmsg::new(ty, args), Fence::default()).await {
        Ok(reply) => println!("{}", reply.payload),
        Err(e) => eprintln!("Error: {}", e),
    }
    mgr.exit().await;
}
