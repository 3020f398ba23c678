use mv_core::cipher;
use mv_core::keys::KeyMaterial;

const PHRASE_A: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
const PHRASE_B: &str =
    "legal winner thank year wave sausage worth useful legal winner thank yellow";

fn salt(fill: u8) -> [u8; 16] {
    [fill; 16]
}

#[test]
fn derivation_is_deterministic() {
    let first = KeyMaterial::derive(PHRASE_A, &salt(1)).expect("first derive");
    let second = KeyMaterial::derive(PHRASE_A, &salt(1)).expect("second derive");
    assert_eq!(first.wallet_address, second.wallet_address);
    assert_eq!(first.symmetric_key, second.symmetric_key);
}

#[test]
fn wallet_address_is_lowercase_prefixed_hex() {
    let keys = KeyMaterial::derive(PHRASE_A, &salt(1)).expect("derive");
    assert!(keys.wallet_address.starts_with("0x"));
    assert_eq!(keys.wallet_address.len(), 42);
    assert!(keys.wallet_address[2..]
        .chars()
        .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[test]
fn wallet_depends_on_phrase_not_salt() {
    let a1 = KeyMaterial::derive(PHRASE_A, &salt(1)).expect("derive a1");
    let a2 = KeyMaterial::derive(PHRASE_A, &salt(2)).expect("derive a2");
    let b = KeyMaterial::derive(PHRASE_B, &salt(1)).expect("derive b");
    assert_eq!(a1.wallet_address, a2.wallet_address);
    assert_ne!(a1.symmetric_key, a2.symmetric_key);
    assert_ne!(a1.wallet_address, b.wallet_address);
}

#[test]
fn phrase_normalization_reaches_key_derivation() {
    let tidy = KeyMaterial::derive(PHRASE_A, &salt(1)).expect("tidy derive");
    let messy = format!("  {} ", PHRASE_A.to_uppercase().replace(' ', "   "));
    let derived = KeyMaterial::derive(&messy, &salt(1)).expect("messy derive");
    assert_eq!(tidy.wallet_address, derived.wallet_address);
    assert_eq!(tidy.symmetric_key, derived.symmetric_key);
}

#[test]
fn sealed_private_key_round_trips() {
    let keys = KeyMaterial::derive(PHRASE_A, &salt(1)).expect("derive");
    let sealed = keys.seal_private_key().expect("seal");
    let opened = cipher::decrypt(&keys.symmetric_key, &sealed).expect("unseal");
    assert!(keys.private_key_matches(&opened));

    let other = KeyMaterial::derive(PHRASE_B, &salt(1)).expect("other derive");
    assert!(!other.private_key_matches(&opened));
}

#[test]
fn compressed_public_key_is_33_bytes_hex() {
    let keys = KeyMaterial::derive(PHRASE_A, &salt(1)).expect("derive");
    let public = keys.compressed_public_key_hex();
    assert!(public.starts_with("0x02") || public.starts_with("0x03"));
    assert_eq!(public.len(), 2 + 66);
}
