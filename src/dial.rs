//! Dial mode.
//!
//! pppd runs us as its connect script with the modem's data line on stdin.
//! All traffic here goes over descriptor 0; there is no discovery and no
//! control-line work, only the conversation that brings up the carrier.

use crate::config::ConfigStore;
use crate::error::{Error, Result};
use crate::session::{self, AT_TIMEOUT};
use crate::tty::{self, AtResponse, ReadBuffer};
use std::os::fd::AsFd;
use std::time::Duration;
use tracing::{info, info_span};

/// Dialing waits for the far end to pick up.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

const DIAL_COMMAND: &str = "ATD*99***1#\r";

pub fn run(store: &dyn ConfigStore, network: &str) -> Result<()> {
    let _span = info_span!("dialer").entered();
    let stdin = std::io::stdin();
    let fd = stdin.as_fd();
    let mut r = ReadBuffer::new();

    tty::set_nonblocking(fd)
        .map_err(|err| Error::Dial(format!("cannot prepare data line: {err}")))?;
    tty::flush_input(fd);
    let _ = tty::put(fd, "ATE0\r");
    let _ = tty::get(fd, &mut r, None, AT_TIMEOUT);

    if let Some(apn) = store.get(network, "udiald_apn").filter(|v| !v.is_empty()) {
        if session::has_forbidden_chars(&apn) {
            return Err(Error::InvalidArg("invalid APN configured".into()));
        }
        let configured = tty::put(fd, &format!("AT+CGDCONT=1,\"IP\",\"{apn}\"\r")).is_ok()
            && matches!(tty::get(fd, &mut r, None, AT_TIMEOUT), Ok(AtResponse::Ok));
        if !configured {
            return Err(Error::Dial(format!(
                "failed to configure packet context ({})",
                r.flatten()
            )));
        }
        info!("using APN {apn}");
    }

    let connected = tty::put(fd, DIAL_COMMAND).is_ok()
        && matches!(
            tty::get(fd, &mut r, None, DIAL_TIMEOUT),
            Ok(AtResponse::Connect)
        );
    if !connected {
        return Err(Error::Dial(format!("failed to dial ({})", r.flatten())));
    }
    info!("carrier established");
    Ok(())
}
