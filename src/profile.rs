//! Modem configuration profiles.
//!
//! A profile names a device, vendor or driver and carries the knowledge that
//! cannot be probed at runtime: which of the modem's serial endpoints carry
//! the control and data channels, and the vendor-specific AT commands that
//! select a radio mode. Profiles defined in the config store are consulted
//! before the built-in table, so users can override entries without
//! rebuilding.

use crate::config::ConfigStore;
use serde_json::json;
use std::fmt;

/// Radio mode selection directive.
///
/// The set is closed: every profile maps each supported tag to a literal AT
/// command string, so new tags require a code change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeTag {
    Auto,
    ForceUmts,
    ForceGprs,
    PreferUmts,
    PreferGprs,
}

impl ModeTag {
    pub const ALL: [ModeTag; 5] = [
        ModeTag::Auto,
        ModeTag::ForceUmts,
        ModeTag::ForceGprs,
        ModeTag::PreferUmts,
        ModeTag::PreferGprs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ModeTag::Auto => "auto",
            ModeTag::ForceUmts => "force-umts",
            ModeTag::ForceGprs => "force-gprs",
            ModeTag::PreferUmts => "prefer-umts",
            ModeTag::PreferGprs => "prefer-gprs",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.name() == name)
    }
}

impl fmt::Display for ModeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-mode AT command strings of a profile.
///
/// `None` means the mode is unsupported. An empty string means the mode is
/// supported but the device needs no command to select it.
#[derive(Debug, Clone, Default)]
pub struct ModeCommands {
    pub auto: Option<String>,
    pub force_umts: Option<String>,
    pub force_gprs: Option<String>,
    pub prefer_umts: Option<String>,
    pub prefer_gprs: Option<String>,
}

impl ModeCommands {
    pub fn get(&self, tag: ModeTag) -> Option<&str> {
        match tag {
            ModeTag::Auto => self.auto.as_deref(),
            ModeTag::ForceUmts => self.force_umts.as_deref(),
            ModeTag::ForceGprs => self.force_gprs.as_deref(),
            ModeTag::PreferUmts => self.prefer_umts.as_deref(),
            ModeTag::PreferGprs => self.prefer_gprs.as_deref(),
        }
    }

    /// Tags this profile supports, in declaration order.
    pub fn supported(&self) -> impl Iterator<Item = ModeTag> + '_ {
        ModeTag::ALL
            .into_iter()
            .filter(|&tag| self.get(tag).is_some())
    }
}

/// A device configuration profile. Immutable once registered.
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    /// USB vendor id to match, `None` for any.
    pub vendor: Option<u16>,
    /// USB device id to match, `None` for any.
    pub device: Option<u16>,
    /// Kernel driver name to match, `None` for any.
    pub driver: Option<String>,
    /// Index of the control channel in the modem's serial endpoint list.
    pub ctl_idx: usize,
    /// Index of the data channel in the modem's serial endpoint list.
    pub dat_idx: usize,
    pub modes: ModeCommands,
}

impl Profile {
    /// A profile matches iff every set selector field equals the candidate's.
    pub fn matches(&self, vendor: u16, device: u16, driver: &str) -> bool {
        self.vendor.map_or(true, |v| v == vendor)
            && self.device.map_or(true, |d| d == device)
            && self.driver.as_deref().map_or(true, |d| d == driver)
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "name": self.name,
            "vendor": self.vendor.map(|v| format!("{v:04x}")),
            "product": self.device.map(|d| format!("{d:04x}")),
            "driver": self.driver,
            "ctlidx": self.ctl_idx,
            "datidx": self.dat_idx,
            "modes": self.modes.supported().map(ModeTag::name).collect::<Vec<_>>(),
        })
    }
}

/// Ordered profile list. User profiles come first so they shadow built-ins;
/// within the built-ins, specific devices precede vendor defaults, which
/// precede driver defaults, so first-match yields the most specific entry.
pub struct ProfileRegistry {
    profiles: Vec<Profile>,
}

impl ProfileRegistry {
    pub fn builtin() -> Self {
        Self {
            profiles: builtin_profiles(),
        }
    }

    pub fn with_user_profiles(user: Vec<Profile>) -> Self {
        let mut profiles = user;
        profiles.extend(builtin_profiles());
        Self { profiles }
    }

    /// First profile whose selectors all match the candidate.
    pub fn find(&self, vendor: u16, device: u16, driver: &str) -> Option<&Profile> {
        self.profiles
            .iter()
            .find(|p| p.matches(vendor, device, driver))
    }

    pub fn by_name(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Profile> {
        self.profiles.iter()
    }
}

/// Load user-defined profiles from sections of type `profile`.
///
/// Recognized options: `name`, `vendor` and `product` (hexadecimal),
/// `driver`, `ctlidx`, `datidx`, and `mode_auto` / `mode_force_umts` /
/// `mode_force_gprs` / `mode_prefer_umts` / `mode_prefer_gprs`.
pub fn load_user_profiles(store: &dyn ConfigStore) -> Vec<Profile> {
    store
        .sections_of_type("profile")
        .into_iter()
        .map(|section| {
            let hex = |option: &str| {
                store
                    .get(&section, option)
                    .and_then(|v| u16::from_str_radix(v.trim_start_matches("0x"), 16).ok())
            };
            Profile {
                name: store.get(&section, "name").unwrap_or_else(|| section.clone()),
                vendor: hex("vendor"),
                device: hex("product"),
                driver: store.get(&section, "driver"),
                ctl_idx: store.get_int(&section, "ctlidx", 0) as usize,
                dat_idx: store.get_int(&section, "datidx", 0) as usize,
                modes: ModeCommands {
                    auto: store.get(&section, "mode_auto"),
                    force_umts: store.get(&section, "mode_force_umts"),
                    force_gprs: store.get(&section, "mode_force_gprs"),
                    prefer_umts: store.get(&section, "mode_prefer_umts"),
                    prefer_gprs: store.get(&section, "mode_prefer_gprs"),
                },
            }
        })
        .collect()
}

fn cmd(s: &str) -> Option<String> {
    Some(s.to_string())
}

/// The built-in profile table. Ordering is significant: specific devices
/// first, then vendor defaults, then driver defaults.
fn builtin_profiles() -> Vec<Profile> {
    vec![
        Profile {
            name: "Ericsson F3705G".into(),
            vendor: Some(0x0bdb),
            device: Some(0x1900),
            driver: None,
            ctl_idx: 1,
            dat_idx: 0,
            modes: ModeCommands {
                auto: cmd("AT+CFUN=1\r"),
                force_umts: cmd("AT+CFUN=6\r"),
                force_gprs: cmd("AT+CFUN=5\r"),
                ..Default::default()
            },
        },
        Profile {
            name: "Alcatel X060s".into(),
            vendor: Some(0x1bbb),
            device: Some(0x0000),
            driver: None,
            ctl_idx: 1,
            dat_idx: 2,
            modes: ModeCommands {
                auto: cmd(""),
                ..Default::default()
            },
        },
        Profile {
            name: "Huawei K3520".into(),
            vendor: Some(0x12d1),
            device: Some(0x1001),
            driver: None,
            ctl_idx: 2,
            dat_idx: 0,
            modes: ModeCommands {
                // Auto means prefer UMTS on this hardware.
                auto: cmd("AT^SYSCFG=2,2,40000000,2,4\r"),
                force_umts: cmd("AT^SYSCFG=14,2,40000000,2,4\r"),
                force_gprs: cmd("AT^SYSCFG=13,1,40000000,2,4\r"),
                prefer_umts: cmd("AT^SYSCFG=2,2,40000000,2,4\r"),
                prefer_gprs: cmd("AT^SYSCFG=2,1,40000000,2,4\r"),
            },
        },
        Profile {
            name: "Huawei E173".into(),
            vendor: Some(0x12d1),
            device: Some(0x1433),
            driver: None,
            ctl_idx: 2,
            dat_idx: 0,
            modes: ModeCommands {
                // Copied from the Huawei generic config; the device seems to
                // lose carrier after switching from gprs back to umts.
                auto: cmd("AT^SYSCFG=2,2,40000000,2,4\r"),
                force_umts: cmd("AT^SYSCFG=14,2,40000000,2,4\r"),
                force_gprs: cmd("AT^SYSCFG=13,1,40000000,2,4\r"),
                prefer_umts: cmd("AT^SYSCFG=2,2,40000000,2,4\r"),
                prefer_gprs: cmd("AT^SYSCFG=2,1,40000000,2,4\r"),
            },
        },
        // Vendor defaults.
        Profile {
            name: "Huawei generic".into(),
            vendor: Some(0x12d1),
            device: None,
            driver: None,
            ctl_idx: 1,
            dat_idx: 0,
            modes: ModeCommands {
                auto: cmd("AT^SYSCFG=2,2,40000000,2,4\r"),
                force_umts: cmd("AT^SYSCFG=14,2,40000000,2,4\r"),
                force_gprs: cmd("AT^SYSCFG=13,1,40000000,2,4\r"),
                prefer_umts: cmd("AT^SYSCFG=2,2,40000000,2,4\r"),
                prefer_gprs: cmd("AT^SYSCFG=2,1,40000000,2,4\r"),
            },
        },
        Profile {
            name: "ZTE generic".into(),
            vendor: Some(0x19d2),
            device: None,
            driver: None,
            ctl_idx: 1,
            dat_idx: 2,
            modes: ModeCommands {
                auto: cmd("AT+ZSNT=0,0,0\r"),
                force_umts: cmd("AT+ZSNT=2,0,0\r"),
                force_gprs: cmd("AT+ZSNT=1,0,0\r"),
                prefer_umts: cmd("AT+ZSNT=0,0,2\r"),
                prefer_gprs: cmd("AT+ZSNT=0,0,1\r"),
            },
        },
        // Driver defaults.
        Profile {
            name: "Option generic".into(),
            vendor: None,
            device: None,
            driver: Some("option".into()),
            ctl_idx: 1,
            dat_idx: 0,
            modes: ModeCommands {
                auto: cmd(""),
                ..Default::default()
            },
        },
        Profile {
            name: "Sierra generic".into(),
            vendor: None,
            device: None,
            driver: Some("sierra".into()),
            ctl_idx: 0,
            dat_idx: 2,
            modes: ModeCommands {
                auto: cmd(""),
                ..Default::default()
            },
        },
        Profile {
            name: "HSO generic".into(),
            vendor: None,
            device: None,
            driver: Some("hso".into()),
            ctl_idx: 0,
            dat_idx: 3,
            modes: ModeCommands {
                auto: cmd("at_opsys=2,2\r"),
                force_umts: cmd("at_opsys=1,2\r"),
                force_gprs: cmd("at_opsys=0,2\r"),
                prefer_umts: cmd("at_opsys=2,2\r"),
                prefer_gprs: cmd("at_opsys=3,2\r"),
            },
        },
        Profile {
            name: "CDC generic".into(),
            vendor: None,
            device: None,
            driver: Some("cdc_acm".into()),
            ctl_idx: 1,
            dat_idx: 0,
            modes: ModeCommands {
                auto: cmd(""),
                ..Default::default()
            },
        },
        Profile {
            name: "USB serial generic".into(),
            vendor: None,
            device: None,
            driver: Some("usbserial".into()),
            ctl_idx: 0,
            dat_idx: 2,
            modes: ModeCommands {
                auto: cmd(""),
                ..Default::default()
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryStore;

    #[test]
    fn mode_tag_names_round_trip() {
        for tag in ModeTag::ALL {
            assert_eq!(ModeTag::from_name(tag.name()), Some(tag));
        }
        assert_eq!(ModeTag::from_name("umts"), None);
        assert_eq!(ModeTag::from_name(""), None);
    }

    #[test]
    fn specific_profiles_win_over_vendor_and_driver_defaults() {
        let registry = ProfileRegistry::builtin();

        let k3520 = registry.find(0x12d1, 0x1001, "option").unwrap();
        assert_eq!(k3520.name, "Huawei K3520");

        // Unknown Huawei device falls back to the vendor default, not the
        // driver default, because vendor entries come first.
        let generic = registry.find(0x12d1, 0x9999, "option").unwrap();
        assert_eq!(generic.name, "Huawei generic");

        let option = registry.find(0x0000, 0x0000, "option").unwrap();
        assert_eq!(option.name, "Option generic");

        assert!(registry.find(0x0000, 0x0000, "unknown").is_none());
    }

    #[test]
    fn user_profiles_shadow_builtins() {
        let user = vec![Profile {
            name: "My K3520".into(),
            vendor: Some(0x12d1),
            device: Some(0x1001),
            driver: None,
            ctl_idx: 0,
            dat_idx: 1,
            modes: ModeCommands {
                auto: Some(String::new()),
                ..Default::default()
            },
        }];
        let registry = ProfileRegistry::with_user_profiles(user);

        assert_eq!(registry.find(0x12d1, 0x1001, "option").unwrap().name, "My K3520");
        // Other devices are unaffected.
        assert_eq!(
            registry.find(0x19d2, 0x0001, "option").unwrap().name,
            "ZTE generic"
        );
    }

    #[test]
    fn reordering_matching_user_profiles_changes_selection() {
        let a = Profile {
            name: "a".into(),
            vendor: Some(0x12d1),
            device: None,
            driver: None,
            ctl_idx: 0,
            dat_idx: 0,
            modes: ModeCommands::default(),
        };
        let b = Profile { name: "b".into(), ..a.clone() };

        let first = ProfileRegistry::with_user_profiles(vec![a.clone(), b.clone()]);
        let second = ProfileRegistry::with_user_profiles(vec![b, a]);

        assert_eq!(first.find(0x12d1, 0x1001, "option").unwrap().name, "a");
        assert_eq!(second.find(0x12d1, 0x1001, "option").unwrap().name, "b");
    }

    #[test]
    fn loads_user_profiles_from_store() {
        let store = MemoryStore::new()
            .with_section("myprofile", "profile")
            .with("myprofile", "name", "Bespoke stick")
            .with("myprofile", "vendor", "12d1")
            .with("myprofile", "product", "14ac")
            .with("myprofile", "ctlidx", "2")
            .with("myprofile", "datidx", "0")
            .with("myprofile", "mode_auto", "AT^SYSCFG=2,2,3fffffff,2,4\r");

        let profiles = load_user_profiles(&store);
        assert_eq!(profiles.len(), 1);
        let p = &profiles[0];
        assert_eq!(p.name, "Bespoke stick");
        assert_eq!(p.vendor, Some(0x12d1));
        assert_eq!(p.device, Some(0x14ac));
        assert_eq!(p.driver, None);
        assert_eq!(p.ctl_idx, 2);
        assert_eq!(p.dat_idx, 0);
        assert_eq!(p.modes.get(ModeTag::Auto), Some("AT^SYSCFG=2,2,3fffffff,2,4\r"));
        assert_eq!(p.modes.get(ModeTag::ForceUmts), None);
    }
}
