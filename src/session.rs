//! The modem session state machine.
//!
//! A session walks a fixed sequence: reset, identify, SIM check, unlock,
//! capability probe, mode selection, dial, supervise, teardown. Every AT
//! transaction is strictly serialized: one command, one answer, no overlap.
//! Each phase failure maps onto a specific kind from the error taxonomy.

use crate::cli::AppMode;
use crate::config::{ConfigStore, GLOBAL_SECTION};
use crate::error::{Error, Result};
use crate::modem::ModemHandle;
use crate::pppd;
use crate::profile::ModeTag;
use crate::signals;
use crate::tty::{self, AtResponse, ReadBuffer};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::process::Child;
use std::time::Duration;
use tracing::{error, info, warn};

/// Default per-transaction answer timeout.
pub const AT_TIMEOUT: Duration = Duration::from_millis(2500);

/// Mode selection can retune the radio and takes longer.
const MODE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Pause between supervise loop iterations.
const STATUS_INTERVAL: Duration = Duration::from_secs(15);

/// Pause after PIN acceptance. Some dongles (Alcatel X060s among them) send
/// CONNECT and immediately hang up when dialed before carrier settles.
const CARRIER_SETTLE: Duration = Duration::from_secs(5);

/// Report RSSI to the log every LOG_STEPS supervise iterations.
const LOG_STEPS: i64 = 4;

/// SIM card state as reported by AT+CPIN?.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimState {
    Ready,
    WantsPin,
    WantsPuk,
    Error,
}

impl SimState {
    /// Value persisted under `sim_state`.
    pub fn as_config_str(self) -> &'static str {
        match self {
            SimState::Ready => "ready",
            SimState::WantsPin => "wantpin",
            SimState::WantsPuk => "wantpuk",
            SimState::Error => "error",
        }
    }
}

/// Characters that must not appear in values interpolated into quoted AT
/// command or pppd config literals.
pub(crate) fn has_forbidden_chars(value: &str) -> bool {
    value.contains(['"', '\r', '\n', ';'])
}

/// Sleep that returns early when interrupted by a signal, so teardown is not
/// delayed by a full interval.
pub(crate) fn sleep_interruptible(duration: Duration) {
    let ts = libc::timespec {
        tv_sec: duration.as_secs() as _,
        tv_nsec: duration.subsec_nanos() as _,
    };
    unsafe { libc::nanosleep(&ts, std::ptr::null_mut()) };
}

pub struct Session<'a> {
    app: AppMode,
    network: String,
    pub modem: ModemHandle,
    ctl: Option<OwnedFd>,
    /// Whether the control fd is published to the signal plane.
    published: bool,
    store: &'a mut dyn ConfigStore,
    pin_override: Option<String>,
    pub sim_state: Option<SimState>,
    pub is_gsm: bool,
    verbosity: i8,
}

impl<'a> Session<'a> {
    pub fn new(
        app: AppMode,
        network: &str,
        modem: ModemHandle,
        store: &'a mut dyn ConfigStore,
        pin_override: Option<String>,
        verbosity: i8,
    ) -> Self {
        Self {
            app,
            network: network.to_string(),
            modem,
            ctl: None,
            published: false,
            store,
            pin_override,
            sim_state: None,
            is_gsm: false,
            verbosity,
        }
    }

    fn probing(&self) -> bool {
        self.app == AppMode::Probe
    }

    fn cfg_set(&mut self, option: &str, value: &str) {
        self.store.set(&self.network, option, value);
    }

    fn fd(&self) -> Result<BorrowedFd<'_>> {
        self.ctl
            .as_ref()
            .map(|fd| fd.as_fd())
            .ok_or_else(|| Error::Internal("control line is not open".into()))
    }

    /// Open the profile-selected control TTY and expose it to the cleanup
    /// signal handler.
    pub fn open_control(&mut self) -> Result<()> {
        let path = format!("/dev/{}", self.modem.ctl_tty);
        let fd = tty::open(Path::new(&path))
            .map_err(|err| Error::Modem(format!("unable to open terminal {path}: {err}")))?;
        signals::publish_control_fd(fd.as_raw_fd());
        self.published = true;
        self.ctl = Some(fd);
        Ok(())
    }

    /// Use an already-open descriptor as the control line. Tests drive
    /// sessions over socketpairs this way; the signal plane stays out of it.
    pub fn attach_control(&mut self, fd: OwnedFd) {
        self.ctl = Some(fd);
        self.published = false;
    }

    fn close_control(&mut self) {
        let Some(fd) = self.ctl.take() else {
            return;
        };
        if self.published && signals::take_control_fd().is_none() {
            // The cleanup handler already closed it; dropping the OwnedFd
            // would close an unrelated reused descriptor.
            std::mem::forget(fd);
        }
        self.published = false;
    }

    /// Hang up and disable command echoing; the response is discarded.
    pub fn reset(&mut self) -> Result<()> {
        let fd = self.fd()?;
        let mut r = ReadBuffer::new();
        tty::flush_input(fd);
        let _ = tty::put(fd, "ATE0\r");
        let _ = tty::get(fd, &mut r, None, AT_TIMEOUT);
        tty::flush_input(fd);
        Ok(())
    }

    /// Query manufacturer and model, persisting them as `modem_name`.
    pub fn identify(&mut self) -> Result<()> {
        let fd = self.fd()?;
        let mut r = ReadBuffer::new();
        let answered = tty::put(fd, "AT+CGMI;+CGMM\r").is_ok()
            && matches!(tty::get(fd, &mut r, None, AT_TIMEOUT), Ok(AtResponse::Ok));
        if !answered || r.line_count() < 3 {
            return Err(Error::Modem("unable to identify modem".into()));
        }
        let name = format!("{} {}", r.line(0).unwrap(), r.line(1).unwrap());
        info!("{}: identified as {name}", self.modem.device_id);
        self.cfg_set("modem_name", &name);
        Ok(())
    }

    /// Query the SIM state, persisting it as `sim_state`.
    pub fn check_sim(&mut self) -> Result<()> {
        let fd = self.fd()?;
        let mut r = ReadBuffer::new();
        tty::flush_input(fd);
        let answered = tty::put(fd, "AT+CPIN?\r").is_ok()
            && matches!(
                tty::get(fd, &mut r, Some("+CPIN: "), AT_TIMEOUT),
                Ok(AtResponse::Ok)
            );
        if !answered || r.result_line().is_none() {
            error!(
                "{}: unable to get SIM status ({})",
                self.modem.device_id,
                r.flatten()
            );
            self.sim_state = Some(SimState::Error);
            self.cfg_set("sim_state", SimState::Error.as_config_str());
            if self.probing() {
                return Ok(());
            }
            return Err(Error::Sim("unable to get SIM status".into()));
        }

        let line = r.result_line().unwrap().into_owned();
        let state = match line.as_str() {
            "+CPIN: READY" => {
                info!("{}: SIM card is ready", self.modem.device_id);
                SimState::Ready
            }
            "+CPIN: SIM PIN" => {
                info!("{}: SIM card requires pin", self.modem.device_id);
                SimState::WantsPin
            }
            "+CPIN: SIM PUK" => {
                warn!("{}: SIM requires PUK", self.modem.device_id);
                SimState::WantsPuk
            }
            _ => {
                self.sim_state = Some(SimState::Error);
                self.cfg_set("sim_state", SimState::Error.as_config_str());
                if self.probing() {
                    error!("{}: unknown SIM status ({line})", self.modem.device_id);
                    return Ok(());
                }
                return Err(Error::Sim(format!("unknown SIM status ({line})")));
            }
        };
        self.sim_state = Some(state);
        self.cfg_set("sim_state", state.as_config_str());
        Ok(())
    }

    /// Unlock the SIM with the configured PIN.
    ///
    /// A PIN that was rejected before is persisted as `failed_pin` and never
    /// retried, so a single wrong entry cannot burn all three attempts
    /// across reconnect cycles.
    pub fn enter_pin(&mut self) -> Result<()> {
        let pin = match self
            .pin_override
            .clone()
            .or_else(|| self.store.get(&self.network, "udiald_pin"))
            .filter(|pin| !pin.is_empty())
        {
            Some(pin) => pin,
            None => {
                return self.unlock_failure(Error::Unlock("no PIN configured".into()));
            }
        };
        if has_forbidden_chars(&pin) {
            return self.unlock_failure(Error::InvalidArg("invalid PIN configured".into()));
        }
        if let Some(failed) = self.store.get(GLOBAL_SECTION, "failed_pin") {
            if failed == pin {
                return self.unlock_failure(Error::Unlock(
                    "not retrying previously failed PIN".into(),
                ));
            }
        }

        let fd = self.fd()?;
        let mut r = ReadBuffer::new();
        tty::flush_input(fd);
        let accepted = tty::put(fd, &format!("AT+CPIN=\"{pin}\"\r")).is_ok()
            && matches!(tty::get(fd, &mut r, None, AT_TIMEOUT), Ok(AtResponse::Ok));
        if !accepted {
            self.store.set(GLOBAL_SECTION, "failed_pin", &pin);
            return self.unlock_failure(Error::Unlock(format!(
                "PIN rejected ({})",
                r.flatten()
            )));
        }

        info!("{}: PIN accepted", self.modem.device_id);
        self.store.delete(GLOBAL_SECTION, "failed_pin");
        self.sim_state = Some(SimState::Ready);
        self.cfg_set("sim_state", SimState::Ready.as_config_str());
        sleep_interruptible(CARRIER_SETTLE);
        Ok(())
    }

    /// In probe mode unlock failures are diagnostic output, not fatal.
    fn unlock_failure(&mut self, err: Error) -> Result<()> {
        if self.probing() {
            error!("{}: {err}", self.modem.device_id);
            Ok(())
        } else {
            Err(err)
        }
    }

    /// Reset the PIN using the PUK. Only valid while the SIM is PUK-locked.
    pub fn enter_puk(&mut self, puk: &str, pin: &str) -> Result<()> {
        if self.sim_state != Some(SimState::WantsPuk) {
            return Err(Error::Sim("cannot use PUK - SIM not locked".into()));
        }
        if has_forbidden_chars(puk) || has_forbidden_chars(pin) {
            return Err(Error::InvalidArg("invalid PIN or PUK".into()));
        }

        let fd = self.fd()?;
        let mut r = ReadBuffer::new();
        tty::flush_input(fd);
        let accepted = tty::put(fd, &format!("AT+CPIN=\"{puk}\",\"{pin}\"\r")).is_ok()
            && matches!(tty::get(fd, &mut r, None, AT_TIMEOUT), Ok(AtResponse::Ok));
        if !accepted {
            return Err(Error::Unlock("failed to reset PIN".into()));
        }
        info!("{}: PIN reset successful", self.modem.device_id);
        self.sim_state = Some(SimState::Ready);
        self.cfg_set("sim_state", SimState::Ready.as_config_str());
        Ok(())
    }

    /// Probe the modem for supported commands and features. Diagnostic only;
    /// individual failures are logged and never fatal.
    pub fn probe(&mut self) {
        info!("starting probe");
        let commands: [(&str, Duration); 25] = [
            // Diagnostic info.
            ("ATI", AT_TIMEOUT),
            // Manufacturer information.
            ("AT+GMI", AT_TIMEOUT),
            // Hardware version.
            ("AT^HWVER", AT_TIMEOUT),
            // Software version.
            ("AT+CGMR", AT_TIMEOUT),
            // Model and revision info (Sierra only?).
            ("AT+GMM", AT_TIMEOUT),
            ("AT+GMR", AT_TIMEOUT),
            // Simlock status: <status>,<tries left>,<operator>.
            ("AT^CARDLOCK?", AT_TIMEOUT),
            // Capabilities.
            ("AT+GCAP", AT_TIMEOUT),
            // Current SIM card lock state and available locking facilities.
            ("AT+CLCK=\"SC\",2", AT_TIMEOUT),
            ("AT+CLCK=?", AT_TIMEOUT),
            // Current and supported functionality levels.
            ("AT+CFUN?", AT_TIMEOUT),
            ("AT+CFUN=?", AT_TIMEOUT),
            // Current and available PDP contexts.
            ("AT+CGDCONT?", AT_TIMEOUT),
            ("AT+CGDCONT=?", AT_TIMEOUT),
            // Network, GPRS and EPS attach status.
            ("AT+CREG?", AT_TIMEOUT),
            ("AT+CGREG?", AT_TIMEOUT),
            ("AT+CEREG?", AT_TIMEOUT),
            // Supported access technologies on Sierra devices.
            ("AT!SELRAT=?", AT_TIMEOUT),
            // ZTE current mode.
            ("AT+ZSNT?", AT_TIMEOUT),
            // Huawei current mode, legacy and new commands.
            ("AT^SYSCFG?", AT_TIMEOUT),
            ("AT^SYSCFGEX?", AT_TIMEOUT),
            ("AT^SYSCFGEX=?", AT_TIMEOUT),
            // Huawei EVDO current mode.
            ("AT^PREFMODE?", AT_TIMEOUT),
            // Current network.
            ("AT+COPS?", AT_TIMEOUT),
            // Scanning available networks may take a while.
            ("AT+COPS=?", Duration::from_millis(45000)),
        ];
        for (cmd, timeout) in commands {
            self.probe_cmd(cmd, timeout);
        }
        info!("probe finished");
    }

    fn probe_cmd(&mut self, cmd: &str, timeout: Duration) {
        let Ok(fd) = self.fd() else { return };
        let mut r = ReadBuffer::new();
        info!("sending {cmd}");
        let answered = tty::put(fd, &format!("{cmd}\r")).is_ok()
            && matches!(tty::get(fd, &mut r, None, timeout), Ok(AtResponse::Ok));
        if !answered {
            error!("{}: {cmd} failed ({})", self.modem.device_id, r.flatten());
            return;
        }
        for line in r.lines() {
            if line.contains("IMEI") {
                info!("<IMEI censored>");
            } else {
                info!("{line}");
            }
        }
    }

    /// Query device capabilities; a GSM modem gets its mode set later.
    /// Failures leave the flag unset and are not fatal.
    pub fn check_caps(&mut self) {
        let Ok(fd) = self.fd() else { return };
        let mut r = ReadBuffer::new();
        let answered = tty::put(fd, "AT+GCAP\r").is_ok()
            && matches!(
                tty::get(fd, &mut r, Some("+GCAP: "), AT_TIMEOUT),
                Ok(AtResponse::Ok)
            );
        if answered {
            if let Some(caps) = r.result_line() {
                if caps.contains("CGSM") {
                    self.is_gsm = true;
                    info!("{}: detected a GSM modem", self.modem.device_id);
                    self.cfg_set("modem_gsm", "1");
                }
            }
        }
    }

    /// Select the radio mode configured under `udiald_mode`.
    ///
    /// An empty command string means the profile supports the mode without
    /// needing a command; the transaction is skipped but still reported as
    /// success.
    pub fn set_mode(&mut self) -> Result<()> {
        let configured = self
            .store
            .get(&self.network, "udiald_mode")
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "auto".to_string());
        let mode = ModeTag::from_name(&configured)
            .ok_or_else(|| Error::InvalidArg(format!("unsupported mode ({configured})")))?;
        let command = self
            .modem
            .profile
            .modes
            .get(mode)
            .ok_or_else(|| Error::InvalidArg(format!("unsupported mode ({mode})")))?
            .to_string();

        let fd = self.fd()?;
        tty::flush_input(fd);
        if !command.is_empty() {
            let mut r = ReadBuffer::new();
            let accepted = tty::put(fd, &command).is_ok()
                && matches!(tty::get(fd, &mut r, None, MODE_TIMEOUT), Ok(AtResponse::Ok));
            if !accepted {
                return Err(Error::Modem(format!(
                    "failed to set mode {mode} ({})",
                    r.flatten()
                )));
            }
        }
        info!("{}: mode set to {mode}", self.modem.device_id);
        Ok(())
    }

    /// Persist our pid, swap to the catch signal handler and start pppd.
    pub fn launch_link(&mut self, tmp: &Path) -> Result<Child> {
        self.cfg_set("pid", &std::process::id().to_string());
        self.store.commit();

        // From here on signals must not close the control line under pppd.
        signals::arm_catch()
            .map_err(|err| Error::Internal(format!("failed to install signal handlers: {err}")))?;

        if self.app == AppMode::Connect {
            self.cfg_set("udiald_state", "dial");
            self.store.commit();
        }

        let config = pppd::write_config(tmp, &self.modem, &self.network, &*self.store, self.verbosity)?;
        pppd::spawn(&config)
    }

    /// Mirror carrier and signal strength into the config store until a
    /// signal arrives.
    pub fn supervise(&mut self) {
        // The catch handler is armed by now and never touches the control
        // line, so the descriptor can be held locally for the whole loop.
        let Some(ctl) = self.ctl.take() else { return };
        let fd = ctl.as_fd();
        let mut r = ReadBuffer::new();

        // Force long alphanumeric carrier names; some devices default to
        // reporting numeric identifiers. 3 sets only the format and leaves
        // network selection untouched.
        let _ = tty::put(fd, "AT+COPS=3,0\r");
        if !matches!(tty::get(fd, &mut r, None, AT_TIMEOUT), Ok(AtResponse::Ok)) {
            warn!(
                "{}: failed to set AT+COPS to long format",
                self.modem.device_id
            );
        }

        let mut provider = String::new();
        let mut status: i64 = -1;
        loop {
            if signals::caught() != 0 {
                break;
            }
            status += 1;
            if status == 0 {
                // Downstream consumers watch for this key before the first
                // measurement arrives; keep setting it ahead of the query.
                self.cfg_set("connected", "1");
                self.store.commit();
            } else {
                sleep_interruptible(STATUS_INTERVAL);
                if signals::caught() != 0 {
                    break;
                }
            }

            tty::flush_input(fd);
            if tty::put(fd, "AT+COPS?;+CSQ\r").is_err() {
                continue;
            }
            if !matches!(tty::get(fd, &mut r, None, AT_TIMEOUT), Ok(AtResponse::Ok))
                || r.line_count() < 3
            {
                continue;
            }

            let cops = r.line(0).unwrap_or_default().into_owned();
            if let Some(name) = carrier_name(&cops) {
                if name != provider {
                    info!("{}: provider is {name}", self.modem.device_id);
                    provider = name.to_string();
                    self.cfg_set("provider", name);
                }
            }

            let csq = r.line(1).unwrap_or_default().into_owned();
            if let Some(rssi) = rssi_value(&csq) {
                self.cfg_set("rssi", rssi);
                if status % LOG_STEPS == 0 {
                    info!("{}: RSSI is {rssi}", self.modem.device_id);
                }
            }
            self.store.commit();
        }
        info!("received signal {}, disconnecting", signals::caught());
        self.ctl = Some(ctl);
    }

    /// Hang up, reap pppd and translate its exit into the final session
    /// outcome. Always produces the terminal error kind; a signal-initiated
    /// teardown surfaces as `Signaled`.
    pub fn finish(&mut self, child: &mut Child) -> Error {
        for option in ["pid", "connected", "provider", "rssi"] {
            self.store.delete(&self.network, option);
        }

        // Terminate the active connection by hanging up and resetting.
        if let Ok(fd) = self.fd() {
            let _ = tty::put(fd, "ATH;&F\r");
        }

        pppd::shutdown(child)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.close_control();
    }
}

/// Extract the carrier name from a `+COPS: 0,0,"FONIC",2` style line: the
/// content between the first pair of double quotes.
fn carrier_name(line: &str) -> Option<&str> {
    let (_, rest) = line.split_once('"')?;
    let (name, _) = rest.split_once('"')?;
    Some(name)
}

/// Extract the RSSI from a `+CSQ: 14,99` style line: the first value after
/// the colon.
fn rssi_value(line: &str) -> Option<&str> {
    line.split([' ', ','])
        .filter(|token| !token.is_empty())
        .nth(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_carrier_between_first_quote_pair() {
        assert_eq!(carrier_name("+COPS: 0,0,\"FONIC\",2"), Some("FONIC"));
        assert_eq!(carrier_name("+COPS: 0,0,\"O2 - de\",2"), Some("O2 - de"));
        assert_eq!(carrier_name("+COPS: 0"), None);
        assert_eq!(carrier_name("+COPS: 0,0,\"unterminated"), None);
    }

    #[test]
    fn extracts_rssi_from_csq_line() {
        assert_eq!(rssi_value("+CSQ: 14,99"), Some("14"));
        assert_eq!(rssi_value("+CSQ: 31,0"), Some("31"));
        assert_eq!(rssi_value("+CSQ:"), None);
    }

    #[test]
    fn rejects_forbidden_characters() {
        assert!(has_forbidden_chars("12\"34"));
        assert!(has_forbidden_chars("12;34"));
        assert!(has_forbidden_chars("12\r34"));
        assert!(has_forbidden_chars("12\n34"));
        assert!(!has_forbidden_chars("1234"));
    }
}
