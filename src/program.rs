//! Top-level orchestration.
//!
//! Mirrors the session lifecycle onto the process: dispatch the selected
//! application mode, run the state machine, and surface the outcome through
//! the exit protocol, which persists the error into the config store before
//! the process exits with the matching code.

use crate::cli::{AppMode, Cli};
use crate::config::{ConfigStore, UciCli};
use crate::dial;
use crate::error::{Error, Result};
use crate::modem::{self, FilterSpec};
use crate::profile::{self, ProfileRegistry};
use crate::session::Session;
use crate::signals;
use std::path::Path;
use tracing::{error, info};

/// Exit code of `Error::Unlock`, checked by the `-t` connect guard.
const UNLOCK_EXIT_CODE: i64 = 7;

/// Status keys cleared at the start of every hardware-touching run.
const STATUS_KEYS: [&str; 8] = [
    "modem_name",
    "modem_driver",
    "modem_id",
    "modem_mode",
    "modem_gsm",
    "sim_state",
    "udiald_error_code",
    "udiald_error_msg",
];

pub fn run(cli: &Cli) -> Result<()> {
    signals::init()
        .map_err(|err| Error::Internal(format!("failed to install signal handlers: {err}")))?;
    let mut store = UciCli::new("network");
    run_with(cli, &mut store, Path::new("/sys"), Path::new("/tmp"))
}

/// Like [`run`], with the collaborators injectable for tests.
pub fn run_with(
    cli: &Cli,
    store: &mut dyn ConfigStore,
    sysfs: &Path,
    tmp: &Path,
) -> Result<()> {
    let app = cli.app();
    let network = cli.network_name.as_str();

    store.add_section(crate::config::GLOBAL_SECTION, "udiald");
    let registry = ProfileRegistry::with_user_profiles(profile::load_user_profiles(store));

    // The listing modes and the pppd reentry bypass the exit protocol; they
    // report through stdout or their own process and leave no state behind.
    match app {
        AppMode::Dial => return dial::run(store, network),
        AppMode::ListProfiles => {
            println!("{}", modem::profile_listing(&registry, cli.format.into())?);
            return Ok(());
        }
        AppMode::ListDevices => {
            let listing =
                modem::device_listing(sysfs, &registry, &cli.filter_spec(), cli.format.into())?;
            println!("{listing}");
            return Ok(());
        }
        _ => {}
    }

    let result = connect_flow(cli, app, network, store, &registry, sysfs, tmp);
    finalize(store, app, network, result, signals::signaled())
}

/// The hardware-touching modes: connect, scan, probe and the unlock apps.
fn connect_flow(
    cli: &Cli,
    app: AppMode,
    network: &str,
    store: &mut dyn ConfigStore,
    registry: &ProfileRegistry,
    sysfs: &Path,
    tmp: &Path,
) -> Result<()> {
    if app == AppMode::Connect
        && cli.test_state
        && store.get_int(network, "udiald_error_code", 0) == UNLOCK_EXIT_CODE
    {
        return Err(Error::Unlock(
            "aborting due to previous SIM unlocking failure; check the PIN and rescan \
             before reconnecting"
                .into(),
        ));
    }

    for key in STATUS_KEYS {
        store.delete(network, key);
    }
    if app == AppMode::Connect {
        store.set(network, "udiald_state", "init");
        store.commit();
    }

    // Only a modem with a valid configuration profile is usable here.
    let mut filter: FilterSpec = cli.filter_spec();
    filter.require_profile = true;
    let modem = modem::find_modem(sysfs, registry, &filter)?;

    let id = format!("{:04x}:{:04x}", modem.vendor, modem.device);
    info!("{}: found {} modem {id}", modem.device_id, modem.driver);
    store.set(network, "modem_id", &id);
    store.set(network, "modem_driver", &modem.driver);
    let supported: Vec<&str> = modem.profile.modes.supported().map(|m| m.name()).collect();
    for mode in &supported {
        store.append(network, "modem_mode", mode);
    }
    info!(
        "{}: configuration profile {} supports modes: {}",
        modem.device_id,
        modem.profile.name,
        supported.join(" ")
    );

    let mut session = Session::new(app, network, modem, store, cli.pin.clone(), cli.verbosity());
    session.open_control()?;
    session.reset()?;
    session.identify()?;
    session.check_sim()?;

    match app {
        AppMode::Scan => return Ok(()),
        AppMode::UnlockPuk => {
            let [puk, pin] = cli.codes.as_slice() else {
                return Err(Error::InvalidArg("invalid arguments".into()));
            };
            session.enter_puk(puk, pin)?;
            return Ok(());
        }
        _ => {}
    }

    if session.sim_state == Some(crate::session::SimState::WantsPin) {
        session.enter_pin()?;
    }
    if app == AppMode::UnlockPin {
        return Ok(());
    }
    if app == AppMode::Probe {
        session.probe();
        return Ok(());
    }
    if session.sim_state == Some(crate::session::SimState::WantsPuk) {
        return Err(Error::Unlock("SIM locked - need PUK".into()));
    }

    session.check_caps();
    if session.is_gsm {
        session.set_mode()?;
    } else {
        info!(
            "{}: skipped setting mode on non-GSM modem",
            session.modem.device_id
        );
    }

    let mut child = session.launch_link(tmp)?;
    session.supervise();
    Err(session.finish(&mut child))
}

/// The exit protocol.
///
/// A signal observed by the cleanup handler overrides whatever error was
/// being surfaced; a clean signal teardown is not an error and writes no
/// message. Everything else lands in `udiald_error_code`/`udiald_error_msg`
/// so the surrounding scripts can report it.
fn finalize(
    store: &mut dyn ConfigStore,
    app: AppMode,
    network: &str,
    result: Result<()>,
    signaled: bool,
) -> Result<()> {
    let result = match result {
        Ok(()) => {
            if app == AppMode::Connect {
                store.delete(network, "udiald_state");
            }
            Ok(())
        }
        Err(err) => {
            let err = if signaled && !err.is_signaled() {
                Error::Signaled("terminated by signal".into())
            } else {
                err
            };
            if !err.is_signaled() {
                store.set(network, "udiald_error_code", &err.exit_code().to_string());
                store.set(network, "udiald_error_msg", &err.to_string());
                error!("{err}");
            }
            if app == AppMode::Connect {
                store.set(network, "udiald_state", "error");
            }
            Err(err)
        }
    };
    store.commit();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryStore;
    use clap::Parser;

    #[test]
    fn finalize_persists_error_code_and_message() {
        let mut store = MemoryStore::new();
        let result = finalize(
            &mut store,
            AppMode::Connect,
            "wan",
            Err(Error::Auth("pppd: invalid credentials".into())),
            false,
        );

        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(store.get("wan", "udiald_error_code").as_deref(), Some("9"));
        assert_eq!(
            store.get("wan", "udiald_error_msg").as_deref(),
            Some("pppd: invalid credentials")
        );
        assert_eq!(store.get("wan", "udiald_state").as_deref(), Some("error"));
        assert!(store.commits > 0);
    }

    #[test]
    fn finalize_overrides_with_signaled_and_writes_no_message() {
        let mut store = MemoryStore::new();
        let result = finalize(
            &mut store,
            AppMode::Connect,
            "wan",
            Err(Error::Network("pppd: terminated by network".into())),
            true,
        );

        assert!(matches!(result, Err(Error::Signaled(_))));
        assert_eq!(store.get("wan", "udiald_error_code"), None);
        assert_eq!(store.get("wan", "udiald_error_msg"), None);
        // The state key still records that the connection went down.
        assert_eq!(store.get("wan", "udiald_state").as_deref(), Some("error"));
    }

    #[test]
    fn finalize_keeps_child_exit_kind_without_signal() {
        // pppd died on its own; teardown was initiated by SIGCHLD, which does
        // not raise the cleanup flag, so the child's kind wins.
        let mut store = MemoryStore::new();
        let result = finalize(
            &mut store,
            AppMode::Connect,
            "wan",
            Err(Error::Auth("pppd: invalid credentials".into())),
            false,
        );
        assert_eq!(result.unwrap_err().exit_code(), 9);
    }

    #[test]
    fn finalize_clears_state_on_success() {
        let mut store = MemoryStore::new().with("wan", "udiald_state", "init");
        let result = finalize(&mut store, AppMode::Connect, "wan", Ok(()), false);
        assert!(result.is_ok());
        assert_eq!(store.get("wan", "udiald_state"), None);
    }

    #[test]
    fn test_state_guard_refuses_connect_after_unlock_failure() {
        let mut store = MemoryStore::new().with("wan", "udiald_error_code", "7");
        let cli = Cli::parse_from(["udiald", "-c", "-t"]);
        let registry = ProfileRegistry::builtin();
        let dir = tempfile::tempdir().unwrap();

        let result = connect_flow(
            &cli,
            AppMode::Connect,
            "wan",
            &mut store,
            &registry,
            dir.path(),
            dir.path(),
        );
        assert!(matches!(result, Err(Error::Unlock(_))));
    }
}
