use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{config::Config, error::Error, ubx};

/// The command line interface for talking to a u-blox module.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// AT commands to send, in order. Their response lines are printed.
    #[arg(short = 'c', long = "command")]
    pub commands: Vec<String>,

    /// Print URCs starting with these prefixes.
    #[arg(short, long = "urc", default_values_t = [String::from("+")])]
    pub urcs: Vec<String>,

    /// Keep running and printing URCs until Ctrl-C.
    #[arg(short, long)]
    pub monitor: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show the UBX frame which polls a message, in hex.
    UbxPoll {
        /// Message class, such as 0x0a.
        #[arg(value_parser = parse_byte)]
        class: u8,

        /// Message id, such as 0x04.
        #[arg(value_parser = parse_byte)]
        id: u8,
    },
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };

    parsed.map_err(|e| format!("{s:?} is not a byte: {e}"))
}

/// Handle a subcommand, printing to stdout.
pub fn handle_command(command: Commands) -> Result<(), Error> {
    match command {
        Commands::Examples(example) => match example {
            Examples::Config => {
                println!("{}", Config::example().serialize_pretty()?);
            }
            Examples::UbxPoll { class, id } => {
                println!("{}", hex(&ubx::encode_to_vec(class, id, &[])?));
            }
        },
    }

    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bytes() {
        assert_eq!(parse_byte("0x0a"), Ok(0x0a));
        assert_eq!(parse_byte("10"), Ok(10));
        assert!(parse_byte("0x100").is_err());
        assert!(parse_byte("b5").is_err());
    }

    #[test]
    fn commands_in_order() {
        let cli = Cli::parse_from(["ubxlib", "conf.ron", "-c", "ATI", "-c", "AT+CGMI", "--monitor"]);

        assert_eq!(cli.commands, vec!["ATI", "AT+CGMI"]);
        assert_eq!(cli.urcs, vec!["+"]);
        assert!(cli.monitor);
        assert_eq!(cli.config, Some(PathBuf::from("conf.ron")));
    }

    #[test]
    fn mon_ver_poll() {
        assert_eq!(
            hex(&ubx::encode_to_vec(0x0a, 0x04, &[]).unwrap()),
            "B5 62 0A 04 00 00 0E 34"
        );
    }
}
