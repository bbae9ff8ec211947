//! Session phase scenarios driven over a socketpair-backed control line.

mod fixture;

use fixture::{k3520, ScriptedModem};
use std::io::Read;
use std::os::unix::net::UnixStream;
use udiald::cli::AppMode;
use udiald::config::{ConfigStore, GLOBAL_SECTION};
use udiald::session::{Session, SimState};
use udiald::test_utils::MemoryStore;
use udiald::Error;

fn session<'a>(
    app: AppMode,
    store: &'a mut MemoryStore,
    pin: Option<&str>,
) -> Session<'a> {
    Session::new(
        app,
        "wan",
        k3520(),
        store,
        pin.map(str::to_string),
        0,
    )
}

#[test]
fn happy_connect_phases_configure_the_modem() {
    let (fd, modem) = ScriptedModem::spawn(vec![
        "OK\r\n",
        "Huawei\r\nE220\r\nOK\r\n",
        "+CPIN: READY\r\nOK\r\n",
        "+GCAP: +CGSM,+FCLASS,+DS\r\nOK\r\n",
        "OK\r\n",
    ]);

    let mut store = MemoryStore::new();
    let mut session = session(AppMode::Connect, &mut store, None);
    session.attach_control(fd);

    session.reset().unwrap();
    session.identify().unwrap();
    session.check_sim().unwrap();
    assert_eq!(session.sim_state, Some(SimState::Ready));
    session.check_caps();
    assert!(session.is_gsm);
    session.set_mode().unwrap();
    drop(session);

    assert_eq!(store.get("wan", "modem_name").as_deref(), Some("Huawei E220"));
    assert_eq!(store.get("wan", "sim_state").as_deref(), Some("ready"));
    assert_eq!(store.get("wan", "modem_gsm").as_deref(), Some("1"));

    // Mode auto on this profile selects prefer-UMTS.
    assert_eq!(
        modem.join(),
        vec![
            "ATE0",
            "AT+CGMI;+CGMM",
            "AT+CPIN?",
            "AT+GCAP",
            "AT^SYSCFG=2,2,40000000,2,4",
        ]
    );
}

#[test]
fn previously_failed_pin_is_refused_without_touching_the_line() {
    let (far, near) = UnixStream::pair().unwrap();
    near.set_nonblocking(true).unwrap();
    far.set_nonblocking(true).unwrap();

    let mut store = MemoryStore::new()
        .with("wan", "udiald_pin", "1234")
        .with(GLOBAL_SECTION, "failed_pin", "1234");
    let mut session = session(AppMode::Connect, &mut store, None);
    session.attach_control(near.into());
    session.sim_state = Some(SimState::WantsPin);

    let err = session.enter_pin().unwrap_err();
    assert!(matches!(err, Error::Unlock(_)));
    assert_eq!(err.exit_code(), 7);

    // Nothing was written to the serial line.
    let mut far = far;
    let mut buf = [0u8; 16];
    assert!(far.read(&mut buf).is_err());
}

#[test]
fn rejected_pin_is_persisted_and_fails_unlock() {
    let (fd, modem) = ScriptedModem::spawn(vec!["ERROR\r\n"]);

    let mut store = MemoryStore::new().with("wan", "udiald_pin", "5678");
    let mut session = session(AppMode::Connect, &mut store, None);
    session.attach_control(fd);
    session.sim_state = Some(SimState::WantsPin);

    let err = session.enter_pin().unwrap_err();
    assert!(matches!(err, Error::Unlock(_)));
    drop(session);

    assert_eq!(store.get(GLOBAL_SECTION, "failed_pin").as_deref(), Some("5678"));
    assert_eq!(modem.join(), vec!["AT+CPIN=\"5678\""]);
}

#[test]
fn accepted_pin_clears_failed_pin_and_readies_the_sim() {
    let (fd, modem) = ScriptedModem::spawn(vec!["OK\r\n"]);

    // The override takes precedence over the configured PIN.
    let mut store = MemoryStore::new()
        .with("wan", "udiald_pin", "1111")
        .with(GLOBAL_SECTION, "failed_pin", "1111");
    let mut session = session(AppMode::Connect, &mut store, Some("5678"));
    session.attach_control(fd);
    session.sim_state = Some(SimState::WantsPin);

    session.enter_pin().unwrap();
    assert_eq!(session.sim_state, Some(SimState::Ready));
    drop(session);

    assert_eq!(store.get(GLOBAL_SECTION, "failed_pin"), None);
    assert_eq!(store.get("wan", "sim_state").as_deref(), Some("ready"));
    assert_eq!(modem.join(), vec!["AT+CPIN=\"5678\""]);
}

#[test]
fn pin_with_forbidden_characters_is_rejected_before_sending() {
    let (far, near) = UnixStream::pair().unwrap();
    near.set_nonblocking(true).unwrap();
    far.set_nonblocking(true).unwrap();

    let mut store = MemoryStore::new().with("wan", "udiald_pin", "12\"34");
    let mut session = session(AppMode::Connect, &mut store, None);
    session.attach_control(near.into());
    session.sim_state = Some(SimState::WantsPin);

    assert!(matches!(session.enter_pin(), Err(Error::InvalidArg(_))));

    let mut far = far;
    let mut buf = [0u8; 16];
    assert!(far.read(&mut buf).is_err());
}

#[test]
fn puk_resets_the_pin_on_a_locked_sim() {
    let (fd, modem) = ScriptedModem::spawn(vec!["OK\r\n"]);

    let mut store = MemoryStore::new();
    let mut session = session(AppMode::UnlockPuk, &mut store, None);
    session.attach_control(fd);
    session.sim_state = Some(SimState::WantsPuk);

    session.enter_puk("87654321", "9999").unwrap();
    drop(session);

    assert_eq!(store.get("wan", "sim_state").as_deref(), Some("ready"));
    assert_eq!(modem.join(), vec!["AT+CPIN=\"87654321\",\"9999\""]);
}

#[test]
fn puk_requires_a_puk_locked_sim() {
    let (_far, near) = UnixStream::pair().unwrap();
    near.set_nonblocking(true).unwrap();

    let mut store = MemoryStore::new();
    let mut session = session(AppMode::UnlockPuk, &mut store, None);
    session.attach_control(near.into());
    session.sim_state = Some(SimState::Ready);

    assert!(matches!(
        session.enter_puk("87654321", "9999"),
        Err(Error::Sim(_))
    ));
}

#[test]
fn sim_states_map_from_cpin_responses() {
    for (response, state, persisted) in [
        ("+CPIN: READY\r\nOK\r\n", SimState::Ready, "ready"),
        ("+CPIN: SIM PIN\r\nOK\r\n", SimState::WantsPin, "wantpin"),
        ("+CPIN: SIM PUK\r\nOK\r\n", SimState::WantsPuk, "wantpuk"),
    ] {
        let (fd, _modem) = ScriptedModem::spawn(vec![response]);
        let mut store = MemoryStore::new();
        let mut session = session(AppMode::Scan, &mut store, None);
        session.attach_control(fd);

        session.check_sim().unwrap();
        assert_eq!(session.sim_state, Some(state));
        drop(session);
        assert_eq!(store.get("wan", "sim_state").as_deref(), Some(persisted));
    }
}

#[test]
fn unknown_sim_state_is_fatal_except_when_probing() {
    let (fd, _modem) = ScriptedModem::spawn(vec!["+CPIN: PH-NET PIN\r\nOK\r\n"]);
    let mut store = MemoryStore::new();
    let mut sess = session(AppMode::Connect, &mut store, None);
    sess.attach_control(fd);
    assert!(matches!(sess.check_sim(), Err(Error::Sim(_))));
    drop(sess);
    assert_eq!(store.get("wan", "sim_state").as_deref(), Some("error"));

    let (fd, _modem) = ScriptedModem::spawn(vec!["+CPIN: PH-NET PIN\r\nOK\r\n"]);
    let mut store = MemoryStore::new();
    let mut sess = session(AppMode::Probe, &mut store, None);
    sess.attach_control(fd);
    sess.check_sim().unwrap();
    assert_eq!(sess.sim_state, Some(SimState::Error));
}

#[test]
fn identify_needs_manufacturer_and_model_lines() {
    let (fd, _modem) = ScriptedModem::spawn(vec!["OK\r\n"]);
    let mut store = MemoryStore::new();
    let mut session = session(AppMode::Connect, &mut store, None);
    session.attach_control(fd);

    assert!(matches!(session.identify(), Err(Error::Modem(_))));
}

#[test]
fn gcap_without_cgsm_leaves_the_modem_non_gsm() {
    let (fd, _modem) = ScriptedModem::spawn(vec!["+GCAP: +FCLASS,+DS\r\nOK\r\n"]);
    let mut store = MemoryStore::new();
    let mut session = session(AppMode::Connect, &mut store, None);
    session.attach_control(fd);

    session.check_caps();
    assert!(!session.is_gsm);
    drop(session);
    assert_eq!(store.get("wan", "modem_gsm"), None);
}

#[test]
fn set_mode_rejects_modes_the_profile_lacks() {
    let (_far, near) = UnixStream::pair().unwrap();
    near.set_nonblocking(true).unwrap();

    let mut store = MemoryStore::new().with("wan", "udiald_mode", "warp-speed");
    let mut session = session(AppMode::Connect, &mut store, None);
    session.attach_control(near.into());

    assert!(matches!(session.set_mode(), Err(Error::InvalidArg(_))));
}

#[test]
fn set_mode_with_empty_command_skips_the_transaction() {
    let (far, near) = UnixStream::pair().unwrap();
    near.set_nonblocking(true).unwrap();
    far.set_nonblocking(true).unwrap();

    let mut store = MemoryStore::new();
    let mut handle = k3520();
    // The Alcatel profile supports auto with no command to send.
    let registry = udiald::profile::ProfileRegistry::builtin();
    handle.profile = registry.by_name("Alcatel X060s").unwrap().clone();
    let mut session = Session::new(AppMode::Connect, "wan", handle, &mut store, None, 0);
    session.attach_control(near.into());

    session.set_mode().unwrap();

    let mut far = far;
    let mut buf = [0u8; 16];
    assert!(far.read(&mut buf).is_err());
}
