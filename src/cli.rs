//! Command-line surface.
//!
//! Application modes are mutually exclusive flags rather than subcommands:
//! pppd re-invokes this binary as `udiald -d -n<net> -D<dev> -p<profile>`,
//! so the flag spelling is an external contract.

use crate::modem::{FilterSpec, ListFormat};
use clap::{ArgAction, ArgGroup, Parser, ValueEnum};

/// UMTS connection manager
#[derive(Parser, Debug)]
#[command(
    name = "udiald",
    about = "UMTS connection manager",
    disable_version_flag = true,
    group = ArgGroup::new("app").multiple(false),
)]
pub struct Cli {
    /// Connect using the modem (default)
    #[arg(short = 'c', long, group = "app")]
    pub connect: bool,

    /// Scan the modem and reset the state file, then exit
    #[arg(short = 's', long, group = "app")]
    pub scan: bool,

    /// Like scan, but do more (debug) probing
    #[arg(long, group = "app")]
    pub probe: bool,

    /// Same as scan but also try to unlock the SIM
    #[arg(short = 'u', long = "unlock-pin", group = "app")]
    pub unlock_pin: bool,

    /// Reset the PIN of a locked SIM using the PUK; takes <PUK> <PIN>
    #[arg(short = 'U', long = "unlock-puk", group = "app")]
    pub unlock_puk: bool,

    /// Dial (used internally as the pppd connect script)
    #[arg(short = 'd', long, group = "app")]
    pub dial: bool,

    /// Detect and list usable devices
    #[arg(short = 'l', long = "list-devices", group = "app")]
    pub list_devices: bool,

    /// List available configuration profiles
    #[arg(short = 'L', long = "list-profiles", group = "app")]
    pub list_profiles: bool,

    /// Network name to use for config reads and status writes
    #[arg(short = 'n', long = "network-name", default_value = "wan")]
    pub network_name: String,

    /// Increase verbosity (once = more info, twice = debug output)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Decrease verbosity (once = errors and warnings only, twice = nothing)
    #[arg(short = 'q', long, action = ArgAction::Count)]
    pub quiet: u8,

    /// Only consider devices with this USB vendor id (hexadecimal)
    #[arg(short = 'V', long, value_parser = parse_hex_id)]
    pub vendor: Option<u16>,

    /// Only consider devices with this USB product id (hexadecimal)
    #[arg(short = 'P', long, value_parser = parse_hex_id)]
    pub product: Option<u16>,

    /// Only consider the device with this id, as listed in sysfs (e.g. 1-1.2)
    #[arg(short = 'D', long = "device-id")]
    pub device_id: Option<String>,

    /// Use this profile instead of autodetecting one (see -L)
    #[arg(short = 'p', long)]
    pub profile: Option<String>,

    /// Use this PIN instead of loading it from the config store
    #[arg(long)]
    pub pin: Option<String>,

    /// Only consider devices for which a configuration profile is available.
    /// Always on with --connect, off by default for the listing modes.
    #[arg(long)]
    pub usable: bool,

    /// Output format for the listing modes
    #[arg(short = 'f', long, value_enum, default_value = "json")]
    pub format: OutputFormat,

    /// Refuse to connect if the previous run failed to unlock the SIM
    #[arg(short = 't')]
    pub test_state: bool,

    /// PUK and new PIN for --unlock-puk
    #[arg(value_name = "CODE", num_args = 0..=2)]
    pub codes: Vec<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Id,
}

impl From<OutputFormat> for ListFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Json => ListFormat::Json,
            OutputFormat::Id => ListFormat::Id,
        }
    }
}

/// Selected application mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Connect,
    Scan,
    Probe,
    UnlockPin,
    UnlockPuk,
    Dial,
    ListDevices,
    ListProfiles,
}

impl Cli {
    pub fn app(&self) -> AppMode {
        if self.scan {
            AppMode::Scan
        } else if self.probe {
            AppMode::Probe
        } else if self.unlock_pin {
            AppMode::UnlockPin
        } else if self.unlock_puk {
            AppMode::UnlockPuk
        } else if self.dial {
            AppMode::Dial
        } else if self.list_devices {
            AppMode::ListDevices
        } else if self.list_profiles {
            AppMode::ListProfiles
        } else {
            AppMode::Connect
        }
    }

    pub fn filter_spec(&self) -> FilterSpec {
        FilterSpec {
            vendor: self.vendor,
            device: self.product,
            device_id: self.device_id.clone(),
            profile_name: self.profile.clone(),
            require_profile: self.usable,
        }
    }

    /// Signed verbosity level: 0 is the default, positive is louder.
    pub fn verbosity(&self) -> i8 {
        self.verbose as i8 - self.quiet as i8
    }
}

fn parse_hex_id(value: &str) -> Result<u16, String> {
    u16::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|err| format!("not a hexadecimal id: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_connect() {
        let cli = Cli::parse_from(["udiald"]);
        assert_eq!(cli.app(), AppMode::Connect);
        assert_eq!(cli.network_name, "wan");
        assert_eq!(cli.verbosity(), 0);
    }

    #[test]
    fn parses_the_pppd_connect_script_invocation() {
        // The argv written into the pppd config file must keep parsing.
        let cli = Cli::parse_from(["udiald", "-d", "-nwan", "-D1-1.2", "-pOption generic", "-v"]);
        assert_eq!(cli.app(), AppMode::Dial);
        assert_eq!(cli.network_name, "wan");
        assert_eq!(cli.device_id.as_deref(), Some("1-1.2"));
        assert_eq!(cli.profile.as_deref(), Some("Option generic"));
        assert_eq!(cli.verbosity(), 1);
    }

    #[test]
    fn parses_filters_and_puk_arguments() {
        let cli = Cli::parse_from([
            "udiald", "-U", "-V", "12d1", "-P", "0x1001", "87654321", "9999",
        ]);
        assert_eq!(cli.app(), AppMode::UnlockPuk);
        assert_eq!(cli.vendor, Some(0x12d1));
        assert_eq!(cli.product, Some(0x1001));
        assert_eq!(cli.codes, vec!["87654321".to_string(), "9999".to_string()]);
    }

    #[test]
    fn rejects_conflicting_modes() {
        assert!(Cli::try_parse_from(["udiald", "-c", "-s"]).is_err());
        assert!(Cli::try_parse_from(["udiald", "-V", "xyz"]).is_err());
    }
}
