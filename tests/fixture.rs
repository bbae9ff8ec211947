//! Shared test fixtures: a scripted modem on the far end of a socketpair and
//! a canned modem handle.

use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::thread::JoinHandle;
use udiald::modem::ModemHandle;
use udiald::profile::ProfileRegistry;

/// Far end of a control line that answers commands from a fixed script.
///
/// AT traffic is strictly serialized, so the script is a plain ordered list
/// of responses; the commands actually received come back from `join` for
/// the test to assert on.
pub struct ScriptedModem {
    handle: JoinHandle<Vec<String>>,
}

impl ScriptedModem {
    /// Spawn the scripted far end and return the near end for the session.
    pub fn spawn(responses: Vec<&'static str>) -> (OwnedFd, Self) {
        let (mut far, near) = UnixStream::pair().unwrap();
        near.set_nonblocking(true).unwrap();

        let handle = std::thread::spawn(move || {
            let mut commands = Vec::new();
            for response in responses {
                match read_command(&mut far) {
                    Some(command) => commands.push(command),
                    None => break,
                }
                far.write_all(response.as_bytes()).unwrap();
            }
            commands
        });

        (near.into(), Self { handle })
    }

    /// Wait for the script to finish and return the commands received.
    pub fn join(self) -> Vec<String> {
        self.handle.join().unwrap()
    }
}

/// Read one carriage-return-terminated command.
fn read_command(stream: &mut UnixStream) -> Option<String> {
    let mut command = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) | Err(_) => return None,
            Ok(_) if byte[0] == b'\r' => break,
            Ok(_) => command.push(byte[0]),
        }
    }
    Some(String::from_utf8_lossy(&command).into_owned())
}

/// A Huawei K3520 as discovery would hand it out.
pub fn k3520() -> ModemHandle {
    let registry = ProfileRegistry::builtin();
    let profile = registry.by_name("Huawei K3520").unwrap().clone();
    ModemHandle {
        vendor: 0x12d1,
        device: 0x1001,
        driver: "option".into(),
        device_id: "1-1.2".into(),
        ttys: vec!["ttyUSB0".into(), "ttyUSB1".into(), "ttyUSB2".into()],
        ctl_tty: "ttyUSB2".into(),
        dat_tty: "ttyUSB0".into(),
        profile,
    }
}
