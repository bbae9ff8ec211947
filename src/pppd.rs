//! Link daemon supervision.
//!
//! pppd owns the data plane; udiald only configures and supervises it. The
//! two cooperate through a generated config file and through pppd invoking
//! this very binary as its connect script, so the argv written below is part
//! of the external interface.

use crate::config::ConfigStore;
use crate::error::{Error, Result};
use crate::modem::ModemHandle;
use crate::signals;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use tracing::{error, info};

const PPPD: &str = "/usr/sbin/pppd";

/// Emit the pppd configuration file and return its path.
///
/// The file carries the owner's credentials (0600) and is created
/// exclusively; a stale file from a previous run is removed first. The name
/// embeds the network name and our pid so concurrent networks cannot
/// collide.
pub fn write_config(
    dir: &Path,
    modem: &ModemHandle,
    network: &str,
    store: &dyn ConfigStore,
    verbosity: i8,
) -> Result<PathBuf> {
    let path = dir.join(format!("udiald-pppd-{network}-{}", std::process::id()));
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(Error::Internal(format!(
                "failed to clean up existing ppp config file: {err}"
            )))
        }
    }

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)
        .map_err(|err| Error::Internal(format!("failed to create ppp config file: {err}")))?;

    let exe = std::env::current_exe()
        .map_err(|err| Error::Internal(format!("cannot resolve own executable: {err}")))?;

    let mut out = BufWriter::new(file);
    render(&mut out, modem, network, store, &exe, verbosity)
        .and_then(|()| out.flush())
        .map_err(|err| Error::Internal(format!("failed to write ppp config file: {err}")))?;

    Ok(path)
}

/// Write the config file body.
///
/// Option order follows what pppd expects: the device and line options
/// first, then the connect script, then the forwarded tunables.
pub fn render(
    out: &mut dyn Write,
    modem: &ModemHandle,
    network: &str,
    store: &dyn ConfigStore,
    exe: &Path,
    verbosity: i8,
) -> io::Result<()> {
    writeln!(out, "/dev/{}", modem.dat_tty)?;
    writeln!(out, "460800")?;
    writeln!(out, "crtscts\nlock\nnoauth\nnoipdefault\nnovj\nnodetach")?;

    if let Some(ifname) = store.get(network, "ifname").filter(|v| !v.is_empty()) {
        writeln!(out, "ifname \"{ifname}\"")?;
    }

    // pppd re-invokes us in dial mode on the data line.
    let verbose_opts = match verbosity {
        ..=0 => "",
        1 => " -v",
        _ => " -v -v",
    };
    writeln!(
        out,
        "connect \"{} -d -n{network} -D{} -p{}{verbose_opts}\"",
        exe.display(),
        modem.device_id,
        modem.profile.name,
    )?;

    writeln!(out, "linkname \"{network}\"")?;
    writeln!(out, "ipparam \"{network}\"")?;

    if store.get_int(network, "defaultroute", 1) != 0 {
        writeln!(out, "defaultroute")?;
    }
    if store.get_int(network, "replacedefaultroute", 0) != 0 {
        writeln!(out, "replacedefaultroute")?;
    }
    if store.get_int(network, "usepeerdns", 1) != 0 {
        writeln!(out, "usepeerdns")?;
    }
    if store.get_int(network, "persist", 1) != 0 {
        writeln!(out, "persist")?;
    }
    let unit = store.get_int(network, "unit", -1);
    if unit > 0 {
        writeln!(out, "unit {unit}")?;
    }
    let maxfail = store.get_int(network, "maxfail", 1);
    if maxfail >= 0 {
        writeln!(out, "maxfail {maxfail}")?;
    }
    let holdoff = store.get_int(network, "holdoff", 0);
    if holdoff >= 0 {
        writeln!(out, "holdoff {holdoff}")?;
    }
    let mtu = store.get_int(network, "udiald_mtu", -1);
    if mtu > 0 {
        writeln!(out, "mtu {mtu}\nmru {mtu}")?;
    }
    if store.get_int(network, "noremoteip", 1) > 0 {
        writeln!(out, "noremoteip")?;
    }

    writeln!(out, "lcp-echo-failure 12")?;

    let credential = |option: &str| {
        store
            .get(network, option)
            .filter(|v| !v.is_empty() && !v.contains(['"', '\r', '\n']))
            .unwrap_or_default()
    };
    writeln!(out, "user \"{}\"", credential("udiald_user"))?;
    writeln!(out, "password \"{}\"", credential("udiald_pass"))?;

    if verbosity > 0 {
        // Log to stderr as well as syslog.
        writeln!(out, "logfd 2")?;
    }
    if verbosity > 1 {
        writeln!(out, "debug")?;
    }

    for opt in store.get_list(network, "udiald_pppdopt") {
        writeln!(out, "{opt}")?;
    }
    Ok(())
}

/// Start pppd against the generated config file.
pub fn spawn(config: &Path) -> Result<Child> {
    info!("starting {PPPD} with config {}", config.display());
    Command::new(PPPD)
        .arg("file")
        .arg(config)
        .spawn()
        .map_err(|err| Error::Internal(format!("pppd: failed to start: {err}")))
}

/// Reap pppd after the supervise loop ends.
///
/// If the child is still running the teardown was signal-initiated: ask it
/// to terminate and report the signal. Otherwise the child's own exit status
/// tells the story and is translated into the error taxonomy.
pub fn shutdown(child: &mut Child) -> Error {
    match child.try_wait() {
        Ok(Some(status)) => translate_exit(status),
        Ok(None) => {
            if let Err(err) = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
                error!("failed to terminate pppd: {err}");
            }
            let _ = child.wait();
            Error::Signaled(format!("terminated by signal {}", signals::caught()))
        }
        Err(err) => Error::Internal(format!("failed to reap pppd: {err}")),
    }
}

/// Map a pppd exit status onto the error taxonomy (codes from `man pppd`).
pub fn translate_exit(status: ExitStatus) -> Error {
    if status.signal().is_some() {
        // pppd was terminated externally; not an error of ours.
        return Error::Signaled("pppd terminated".into());
    }
    match status.code().unwrap_or(-1) {
        5 => Error::Signaled("pppd terminated".into()),
        7 | 16 => Error::Modem("pppd: modem error".into()),
        8 => Error::Dial("pppd: dialing error".into()),
        0 | 15 => Error::Network("pppd: terminated by network".into()),
        19 => Error::Auth("pppd: invalid credentials".into()),
        code => Error::Ppp(format!("pppd: other error ({code})")),
    }
}
