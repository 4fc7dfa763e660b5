//! Static catalogue of trusted device identities.
//!
//! Maps the hex digest of a verified-boot public key to the device model
//! and OS family it belongs to. Four tables: TEE vs StrongBox keystore,
//! each split into stock-firmware and custom-OS entries. The tables are
//! operator-maintained data baked into the binary and immutable after
//! process start.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use auditord_types::SecurityLevel;

/// Identity of a catalogued device model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Marketing name of the device model.
    pub name: &'static str,
    /// OS family running on it.
    pub os_name: &'static str,
}

/// Which firmware subtable a verified-boot state selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OsVariant {
    /// Bootloader verified the factory OS key.
    Stock,
    /// Bootloader verified a user-installed signing key.
    Custom,
}

const STOCK_OS: &str = "Stock";
const CUSTOM_OS: &str = "Meridian OS";

// Verified-boot key digests, one per (model, signing key). StrongBox
// devices attest with a different batch key than their TEE keystore, so
// the same model can appear in both tables under different digests.
pub(crate) const SAILFISH_TEE_STOCK: &str =
    "4D0E9AB5C7F1208396E2B8D44A71C5FE02396B8853DF74C181EA25A4C236DD09";
pub(crate) const SAILFISH_TEE_CUSTOM: &str =
    "91C2E7B03FA8556D12D0C4AE77B9130F6A54D82E09CB3F618E4A7D25B0961C44";
pub(crate) const WALLEYE_TEE_STOCK: &str =
    "0F7AD1E26C93B5480A6BD7F31E98C24D5570A8EB16F34C9D2208B6A47D5E1390";
pub(crate) const WALLEYE_TEE_CUSTOM: &str =
    "7BE03D8C215FA6941D38E0B566C47A2F90D1B53E84A6C7F20B9D415E683C07DA";
pub(crate) const CROSSHATCH_SB_STOCK: &str =
    "A35D90B84E17F2C6058ADB33761E94F00C28D5B7491EA6C3D47F08225B16E9CD";
pub(crate) const CROSSHATCH_SB_CUSTOM: &str =
    "58F1A04B97D3E62C10B5F8D429A7630E85C1D4FB0A962E738D54B1C69F27A005";
pub(crate) const CORAL_SB_STOCK: &str =
    "C49B27E05A83F1D6249CE07B815FD3A490362BE8D175A04CF6E89D3B2C50471E";
pub(crate) const CORAL_SB_CUSTOM: &str =
    "2E68D4A1F05C39B7861D24E9530BA7CD14F60E83B925DC7A40831F5E6D97C2B8";
pub(crate) const BARBET_TEE_STOCK: &str =
    "6A21C5F89E04D7B3157F2AD60C83E9B4D02758F1A36BE49C08D1674A3E95B0F2";
pub(crate) const RAVEN_SB_STOCK: &str =
    "D18E530C6B2F97A4E3805D1B48C26F7902AE4D5C173B08F6A9D42E15C7B3806F";

static TEE_STOCK: Lazy<HashMap<&'static str, DeviceInfo>> = Lazy::new(|| {
    HashMap::from([
        (SAILFISH_TEE_STOCK, DeviceInfo { name: "Sailfish", os_name: STOCK_OS }),
        (WALLEYE_TEE_STOCK, DeviceInfo { name: "Walleye", os_name: STOCK_OS }),
        (BARBET_TEE_STOCK, DeviceInfo { name: "Barbet", os_name: STOCK_OS }),
    ])
});

static TEE_CUSTOM: Lazy<HashMap<&'static str, DeviceInfo>> = Lazy::new(|| {
    HashMap::from([
        (SAILFISH_TEE_CUSTOM, DeviceInfo { name: "Sailfish", os_name: CUSTOM_OS }),
        (WALLEYE_TEE_CUSTOM, DeviceInfo { name: "Walleye", os_name: CUSTOM_OS }),
    ])
});

static STRONGBOX_STOCK: Lazy<HashMap<&'static str, DeviceInfo>> = Lazy::new(|| {
    HashMap::from([
        (CROSSHATCH_SB_STOCK, DeviceInfo { name: "Crosshatch", os_name: STOCK_OS }),
        (CORAL_SB_STOCK, DeviceInfo { name: "Coral", os_name: STOCK_OS }),
        (RAVEN_SB_STOCK, DeviceInfo { name: "Raven", os_name: STOCK_OS }),
    ])
});

static STRONGBOX_CUSTOM: Lazy<HashMap<&'static str, DeviceInfo>> = Lazy::new(|| {
    HashMap::from([
        (CROSSHATCH_SB_CUSTOM, DeviceInfo { name: "Crosshatch", os_name: CUSTOM_OS }),
        (CORAL_SB_CUSTOM, DeviceInfo { name: "Coral", os_name: CUSTOM_OS }),
    ])
});

fn table(level: SecurityLevel, variant: OsVariant) -> &'static HashMap<&'static str, DeviceInfo> {
    match (level, variant) {
        (SecurityLevel::Tee, OsVariant::Stock) => &TEE_STOCK,
        (SecurityLevel::Tee, OsVariant::Custom) => &TEE_CUSTOM,
        (SecurityLevel::StrongBox, OsVariant::Stock) => &STRONGBOX_STOCK,
        (SecurityLevel::StrongBox, OsVariant::Custom) => &STRONGBOX_CUSTOM,
    }
}

/// Look up a verified-boot key digest in the subtable selected by the
/// keystore security level and firmware variant. The security level in
/// the attestation extension decides the StrongBox/TEE split even if a
/// digest were ever present in both.
pub fn lookup(
    level: SecurityLevel,
    variant: OsVariant,
    verified_boot_key_hex: &str,
) -> Option<&'static DeviceInfo> {
    table(level, variant).get(verified_boot_key_hex)
}

/// Look up a digest under a security level when the firmware variant is
/// not known, trying custom-OS entries first. Used when rendering stored
/// devices, which persist the digest but not the boot state.
pub fn lookup_any(level: SecurityLevel, verified_boot_key_hex: &str) -> Option<&'static DeviceInfo> {
    lookup(level, OsVariant::Custom, verified_boot_key_hex)
        .or_else(|| lookup(level, OsVariant::Stock, verified_boot_key_hex))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_and_custom_are_distinct() {
        let stock = lookup(SecurityLevel::Tee, OsVariant::Stock, SAILFISH_TEE_STOCK).unwrap();
        let custom = lookup(SecurityLevel::Tee, OsVariant::Custom, SAILFISH_TEE_CUSTOM).unwrap();
        assert_eq!(stock.name, custom.name);
        assert_ne!(stock.os_name, custom.os_name);
    }

    #[test]
    fn security_level_selects_table() {
        assert!(lookup(SecurityLevel::StrongBox, OsVariant::Stock, CROSSHATCH_SB_STOCK).is_some());
        assert!(lookup(SecurityLevel::Tee, OsVariant::Stock, CROSSHATCH_SB_STOCK).is_none());
    }

    #[test]
    fn unknown_digest_misses() {
        let bogus = "00".repeat(32);
        assert!(lookup(SecurityLevel::Tee, OsVariant::Stock, &bogus).is_none());
        assert!(lookup_any(SecurityLevel::StrongBox, &bogus).is_none());
    }

    #[test]
    fn lookup_any_prefers_custom() {
        let info = lookup_any(SecurityLevel::StrongBox, CORAL_SB_CUSTOM).unwrap();
        assert_eq!(info.os_name, CUSTOM_OS);
    }
}
