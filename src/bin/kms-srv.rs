extern crate clap;
extern crate hex;
extern crate kms;
extern crate log;
extern crate stderrlog;

use clap::{App, Arg};
use kms::core::server::{Server, ServerConfig, DEFAULT_PORT};
use kms::core::{ClientStore, MemoryStore};
use log::*;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::process::exit;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

const VERSION: &str = "0.1.0";

fn main() {
    /* parse arguments from CLI */
    let args = App::new("kms-srv")
        .version(VERSION)
        .about("Volume activation host speaking the KMS protocol over DCE/RPC")
        .arg(
            Arg::new("ip")
                .short('i')
                .long("ip")
                .value_name("addr")
                .help("address to listen on, repeatable; wildcard IPv6 by default")
                .takes_value(true)
                .multiple_occurrences(true),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("TCP port, 1688 by default")
                .takes_value(true),
        )
        .arg(
            Arg::new("epid")
                .short('e')
                .long("epid")
                .help("fixed extended PID instead of a synthesized one")
                .takes_value(true),
        )
        .arg(
            Arg::new("hwid")
                .short('w')
                .long("hwid")
                .help("fixed hardware id as 16 hex digits")
                .takes_value(true),
        )
        .arg(
            Arg::new("count")
                .short('c')
                .long("client-count")
                .help("client count reported to activating clients")
                .takes_value(true),
        )
        .arg(
            Arg::new("verbosity")
                .short('v')
                .multiple_occurrences(true)
                .help("Increase message verbosity"),
        )
        .get_matches();

    /* initialise logger */
    stderrlog::new()
        .module(module_path!())
        .module("kms")
        .verbosity(args.occurrences_of("verbosity") as usize + 2)
        .init()
        .expect("error while initializing logging module");

    let mut config = ServerConfig::default();

    let port: u16 = match args.value_of("port") {
        Some(raw) => match raw.parse() {
            Ok(port) => port,
            Err(_) => {
                error!("invalid port: {}", raw);
                exit(1);
            }
        },
        None => DEFAULT_PORT,
    };
    config.bind_addrs = match args.values_of("ip") {
        Some(addresses) => addresses
            .map(|raw| match IpAddr::from_str(raw) {
                Ok(ip) => SocketAddr::from((ip, port)),
                Err(_) => {
                    error!("invalid listen address: {}", raw);
                    exit(1);
                }
            })
            .collect(),
        None => vec![SocketAddr::from((IpAddr::V6(Ipv6Addr::UNSPECIFIED), port))],
    };

    config.epid = args.value_of("epid").map(String::from);
    if let Some(raw) = args.value_of("hwid") {
        match hex::decode(raw) {
            Ok(bytes) if bytes.len() == 8 => {
                let mut hwid = [0u8; 8];
                hwid.copy_from_slice(&bytes);
                config.hwid = Some(hwid);
            }
            _ => {
                error!("hardware id must be exactly 16 hex digits");
                exit(1);
            }
        }
    }
    if let Some(raw) = args.value_of("count") {
        match raw.parse() {
            Ok(count) => config.client_count = count,
            Err(_) => {
                error!("invalid client count: {}", raw);
                exit(1);
            }
        }
    }

    let server = Server::new(config, MemoryStore::new());

    /* periodic activity report over the recorded clients */
    let dispatcher = server.dispatcher().clone();
    thread::spawn(move || loop {
        thread::sleep(Duration::from_secs(60));
        info!("{} clients on record", dispatcher.store().list().len());
    });

    if let Err(e) = server.run() {
        error!("server failed: {:?}", e);
        exit(1);
    }
}
