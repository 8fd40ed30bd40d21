use std::net::SocketAddr;

use clap::{Arg, Command};

pub fn root_command() -> Command<'static> {
    let command = Command::new(clap::crate_name!())
        .about(clap::crate_description!())
        .version(clap::crate_version!())
        .subcommand_required(true)
        .subcommand(crate::lookup::create_command());

    crate::logging::logging_args(command)
}

const BIND_ADDRESS_HELP: &str = "Address of the outgoing network interface";
const BIND_ADDRESS_HELP_LONG: &str = "IP address and port number of the outgoing network interface.

Example: \"192.168.1.100:0\" specifies the network interface \
with IP address 192.168.1.100, and 0 to indicate a default port number.";

pub fn bind_address<'h>() -> Arg<'h> {
    Arg::new("bind-address")
        .long("bind-address")
        .takes_value(true)
        .value_parser(clap::value_parser!(SocketAddr))
        .help(BIND_ADDRESS_HELP)
        .long_help(BIND_ADDRESS_HELP_LONG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_command() {
        root_command().debug_assert();
    }
}
