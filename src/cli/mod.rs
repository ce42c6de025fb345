pub mod commands;

use clap::{value_parser, Arg, ArgAction, Command};

pub use commands::handle_subcommands;

/// Command-line interface. Global options override the configuration file.
pub fn build_cli() -> Command {
    let command = Command::new("sinamics-monitor")
        .version(crate::VERSION)
        .about("Sinamics drive control and condition monitoring over Modbus RTU")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file")
                .global(true),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .env("SINAMICS_PORT")
                .help("Serial port, e.g. /dev/ttyUSB0 or COM3")
                .global(true),
        )
        .arg(
            Arg::new("baud")
                .short('b')
                .long("baud")
                .value_name("BAUD")
                .value_parser(value_parser!(u32))
                .help("Baud rate")
                .global(true),
        )
        .arg(
            Arg::new("slave")
                .short('s')
                .long("slave")
                .value_name("ID")
                .value_parser(value_parser!(u8).range(1..=247))
                .help("Modbus slave id of the drive")
                .global(true),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .long("interval")
                .value_name("MS")
                .value_parser(value_parser!(u64).range(1..))
                .help("Poll interval in milliseconds")
                .global(true),
        )
        .arg(
            Arg::new("simulate")
                .long("simulate")
                .action(ArgAction::SetTrue)
                .help("Talk to an in-process simulated drive instead of the serial port")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Debug logging")
                .global(true),
        )
        .subcommand(Command::new("monitor").about("Poll continuously, score samples and raise maintenance alerts"))
        .subcommand(Command::new("read").about("Read the drive once and print the decoded state"))
        .subcommand(
            Command::new("command")
                .about("Send a single validated command")
                .subcommand_required(true)
                .subcommand(Command::new("start").about("Start the motor"))
                .subcommand(Command::new("stop").about("Stop the motor"))
                .subcommand(Command::new("reset-fault").about("Acknowledge the active fault"))
                .subcommand(
                    Command::new("set-speed").about("Set the speed setpoint").arg(
                        Arg::new("percent")
                            .value_name("PCT")
                            .required(true)
                            .allow_negative_numbers(true)
                            .value_parser(value_parser!(f64))
                            .help("Percent of the reference speed; negative reverses"),
                    ),
                ),
        )
        .subcommand(Command::new("ports").about("List available serial ports"))
        .subcommand(
            Command::new("config")
                .about("Write the default configuration")
                .arg(Arg::new("path").value_name("PATH").required(true)),
        );

    #[cfg(feature = "sqlite")]
    let command = command.subcommand(
        Command::new("history").about("Print recently stored samples and alerts").arg(
            Arg::new("limit")
                .short('n')
                .long("limit")
                .value_name("N")
                .value_parser(value_parser!(i64).range(1..))
                .default_value("20"),
        ),
    );

    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn global_options_override_configuration() {
        let matches = build_cli()
            .try_get_matches_from([
                "sinamics-monitor",
                "monitor",
                "--port",
                "/dev/ttyUSB3",
                "--slave",
                "7",
                "--interval",
                "500",
            ])
            .unwrap();

        let mut config = Config::default();
        config.apply_overrides(&matches).unwrap();
        assert_eq!(config.port, "/dev/ttyUSB3");
        assert_eq!(config.slave_id, 7);
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.baud_rate, 9600);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(build_cli()
            .try_get_matches_from(["sinamics-monitor", "--slave", "0", "read"])
            .is_err());
        assert!(build_cli()
            .try_get_matches_from(["sinamics-monitor", "--interval", "0", "read"])
            .is_err());
        assert!(build_cli().try_get_matches_from(["sinamics-monitor"]).is_err());
    }
}
