//! 2-of-3 multisig script and address construction
//!
//! Given the primary, backup, and cosigner keys derived at one matched
//! chain/index suffix, this module produces the redeem script and address for
//! that path. Public keys are sorted lexicographically by their serialized
//! bytes before being pushed, so any two of the three key holders construct
//! byte-identical scripts independently, as multisig interop requires.
//!
//! The wallet's script mode (legacy P2SH vs P2SH-wrapped P2WSH) is fixed at
//! creation and applies to every address.

use bitcoin::blockdata::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_2, OP_PUSHNUM_3};
use bitcoin::blockdata::script::Builder;
use bitcoin::{Address, Network, PublicKey, ScriptBuf};

use crate::error::{WalletError, WalletResult};
use crate::keys::{HDKey, KeyTrio};
use crate::types::WalletMode;

/// The derived script set and address for one derivation path.
///
/// This is a cache, not a source of truth: it is regenerable at any time from
/// the keychain and the path, and is never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletScript {
    /// The 2-of-3 `OP_CHECKMULTISIG` script. For segwit wallets this is the
    /// witness script; for legacy wallets it doubles as the redeem script.
    pub multisig: ScriptBuf,
    /// What the spending input's scriptSig ultimately pushes: the multisig
    /// script itself (legacy) or its v0 witness program (segwit).
    pub redeem_script: ScriptBuf,
    /// The P2SH scriptPubKey funds are sent to.
    pub script_pubkey: ScriptBuf,
    /// The resulting address.
    pub address: Address,
    /// Script mode the wallet was created with.
    pub mode: WalletMode,
}

/// Construct the wallet script for three keys derived at matched paths.
///
/// Fails with [`WalletError::PathMismatch`] unless all three keys share the
/// same chain/index suffix.
pub fn build_script(
    primary: &HDKey,
    backup: &HDKey,
    cosigner: &HDKey,
    mode: WalletMode,
    network: Network,
) -> WalletResult<WalletScript> {
    check_path_matched(primary, backup)?;
    check_path_matched(primary, cosigner)?;

    let multisig = sorted_multisig_2_of_3(&[
        primary.public_key(),
        backup.public_key(),
        cosigner.public_key(),
    ]);

    let redeem_script = match mode {
        WalletMode::Legacy => multisig.clone(),
        WalletMode::Segwit => multisig.to_v0_p2wsh(),
    };

    let address = Address::p2sh(&redeem_script, network)
        .map_err(|e| WalletError::Validation(format!("redeem script not wrappable: {}", e)))?;
    let script_pubkey = address.script_pubkey();

    Ok(WalletScript {
        multisig,
        redeem_script,
        script_pubkey,
        address,
        mode,
    })
}

/// Convenience wrapper taking a derived [`KeyTrio`].
pub fn build_script_for_trio(
    trio: &KeyTrio,
    mode: WalletMode,
    network: Network,
) -> WalletResult<WalletScript> {
    build_script(&trio.primary, &trio.backup, &trio.cosigner, mode, network)
}

fn check_path_matched(reference: &HDKey, other: &HDKey) -> WalletResult<()> {
    if reference.path != other.path {
        return Err(WalletError::PathMismatch {
            expected: reference.path.to_string(),
            found: other.path.to_string(),
        });
    }
    Ok(())
}

/// Build `OP_2 <k1> <k2> <k3> OP_3 OP_CHECKMULTISIG` with keys in canonical
/// (lexicographic serialized-bytes) order.
fn sorted_multisig_2_of_3(keys: &[PublicKey; 3]) -> ScriptBuf {
    let mut sorted: Vec<PublicKey> = keys.to_vec();
    sorted.sort_by_key(|k| k.to_bytes());

    let mut builder = Builder::new().push_opcode(OP_PUSHNUM_2);
    for key in &sorted {
        builder = builder.push_key(key);
    }
    builder
        .push_opcode(OP_PUSHNUM_3)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{derive_public, parse_path, SECP};
    use bitcoin::bip32::{ExtendedPrivKey, ExtendedPubKey};

    fn key_at(seed: u8, path: &str) -> HDKey {
        let xprv = ExtendedPrivKey::new_master(Network::Testnet, &[seed; 32]).unwrap();
        let xpub = ExtendedPubKey::from_priv(&SECP, &xprv);
        derive_public(&xpub, &parse_path(path).unwrap()).unwrap()
    }

    #[test]
    fn key_order_does_not_change_the_script() {
        let (a, b, c) = (key_at(1, "m/0/0"), key_at(2, "m/0/0"), key_at(3, "m/0/0"));
        let s1 = build_script(&a, &b, &c, WalletMode::Legacy, Network::Testnet).unwrap();
        let s2 = build_script(&c, &a, &b, WalletMode::Legacy, Network::Testnet).unwrap();
        assert_eq!(s1.multisig, s2.multisig);
        assert_eq!(s1.address, s2.address);
    }

    #[test]
    fn mismatched_paths_are_rejected() {
        let a = key_at(1, "m/0/0");
        let b = key_at(2, "m/0/0");
        let c = key_at(3, "m/0/1");
        let err =
            build_script(&a, &b, &c, WalletMode::Legacy, Network::Testnet).unwrap_err();
        assert!(matches!(err, WalletError::PathMismatch { .. }));
    }

    #[test]
    fn segwit_redeem_script_is_the_witness_program() {
        let (a, b, c) = (key_at(1, "m/0/0"), key_at(2, "m/0/0"), key_at(3, "m/0/0"));
        let script = build_script(&a, &b, &c, WalletMode::Segwit, Network::Testnet).unwrap();
        assert_eq!(script.redeem_script, script.multisig.to_v0_p2wsh());
        assert_ne!(script.redeem_script, script.multisig);
    }

    #[test]
    fn legacy_and_segwit_addresses_differ() {
        let (a, b, c) = (key_at(1, "m/0/0"), key_at(2, "m/0/0"), key_at(3, "m/0/0"));
        let legacy = build_script(&a, &b, &c, WalletMode::Legacy, Network::Testnet).unwrap();
        let segwit = build_script(&a, &b, &c, WalletMode::Segwit, Network::Testnet).unwrap();
        assert_eq!(legacy.multisig, segwit.multisig);
        assert_ne!(legacy.address, segwit.address);
    }
}
