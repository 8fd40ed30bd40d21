use std::{cell::RefCell, net::SocketAddr, rc::Rc, time::Duration};

use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use dnsstep::{
    channel::{UdpChannel, UdpChannelBuilder},
    process,
    query::{self, QueryError},
    reactor::TokioReactor,
};
use serde::Serialize;
use trust_dns_resolver::proto::op::Message;

pub fn create_command() -> Command<'static> {
    Command::new("lookup")
        .about("Send one DNS query and process it step by step")
        .arg(crate::args::bind_address())
        .arg(
            Arg::new("nameserver")
                .long("nameserver")
                .takes_value(true)
                .value_parser(clap::value_parser!(SocketAddr))
                .default_value("8.8.8.8:53")
                .help("Address of the name server. (Example: 1.1.1.1:53)"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .takes_value(true)
                .value_parser(clap::value_parser!(u64))
                .default_value("5")
                .help("Seconds to wait for a response to each attempt"),
        )
        .arg(
            Arg::new("attempts")
                .long("attempts")
                .takes_value(true)
                .value_parser(clap::value_parser!(u32).range(1..))
                .default_value("3")
                .help("Number of times the query is sent before giving up"),
        )
        .arg(
            Arg::new("type")
                .required(true)
                .help("DNS record type as string or integer"),
        )
        .arg(
            Arg::new("hostname")
                .required(true)
                .help("Target hostname to query"),
        )
}

fn config_channel(
    mut builder: UdpChannelBuilder,
    matches: &ArgMatches,
) -> anyhow::Result<UdpChannelBuilder> {
    if let Some(value) = matches.get_one::<SocketAddr>("nameserver") {
        builder = builder.with_nameserver(*value);
    }

    if let Some(value) = matches.get_one::<SocketAddr>("bind-address") {
        builder = builder.with_bind_address(*value);
    }

    if let Some(value) = matches.get_one::<u64>("timeout") {
        builder = builder.with_timeout(Duration::from_secs(*value));
    }

    if let Some(value) = matches.get_one::<u32>("attempts") {
        builder = builder.with_attempts(*value);
    }

    Ok(builder)
}

/// Lookup result printed as JSON.
#[derive(Debug, Serialize)]
struct LookupResponse {
    id: u16,
    response_code: &'static str,
    text_records: Vec<String>,
    steps: usize,
}

impl LookupResponse {
    fn new(message: &Message, steps: usize) -> Self {
        Self {
            id: message.id(),
            response_code: message.response_code().to_str(),
            text_records: message
                .answers()
                .iter()
                .map(|record| record.to_string())
                .collect(),
            steps,
        }
    }
}

pub async fn run(arg_matches: &ArgMatches) -> anyhow::Result<()> {
    let mut channel = config_channel(UdpChannel::builder(), arg_matches)?.build();
    let record_type = query::parse_record_type(arg_matches.get_one::<String>("type").unwrap())?;
    let hostname = arg_matches.get_one::<String>("hostname").unwrap();

    tracing::info!(nameserver = %channel.nameserver(), %hostname, ?record_type, "lookup");

    let response: Rc<RefCell<Option<Result<Message, QueryError>>>> = Rc::default();
    let sink = response.clone();

    channel.query(hostname, record_type, move |result| {
        sink.borrow_mut().replace(result);
    });

    let steps = process::process_until_drained(&mut channel, &TokioReactor::new()).await?;
    let message = response
        .borrow_mut()
        .take()
        .context("query did not complete")??;

    println!(
        "{}",
        serde_json::to_string_pretty(&LookupResponse::new(&message, steps))?
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use trust_dns_resolver::proto::{
        op::ResponseCode,
        rr::{RData, Record},
    };

    use super::*;

    #[test]
    fn test_config_channel() {
        let matches = create_command()
            .try_get_matches_from([
                "lookup",
                "--nameserver",
                "127.0.0.1:5353",
                "--attempts",
                "1",
                "AAAA",
                "example.com",
            ])
            .unwrap();

        let channel = config_channel(UdpChannel::builder(), &matches)
            .unwrap()
            .build();

        assert_eq!(channel.nameserver(), "127.0.0.1:5353".parse().unwrap());
    }

    #[test]
    fn test_attempts_range() {
        let result = create_command().try_get_matches_from([
            "lookup",
            "--attempts",
            "0",
            "A",
            "example.com",
        ]);

        assert!(result.is_err());
    }

    #[test]
    fn test_lookup_response() {
        let mut message = Message::new();
        message.set_id(42).add_answer(Record::from_rdata(
            "example.com.".parse().unwrap(),
            60,
            RData::A(Ipv4Addr::new(192, 0, 2, 1)),
        ));

        let response = LookupResponse::new(&message, 2);
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["id"], 42);
        assert_eq!(json["response_code"], ResponseCode::NoError.to_str());
        assert_eq!(json["steps"], 2);
        assert_eq!(json["text_records"].as_array().unwrap().len(), 1);
    }
}
