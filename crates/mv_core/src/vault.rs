use crate::app_error::{AppError, AppResult};
use crate::cipher;
use crate::keys::{self, KeyMaterial, SYMMETRIC_SALT_LEN};
use crate::phrase;
use crate::store;
use crate::timefmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const DB_FILE: &str = "memvault.sqlite";
pub const SALT_FILE: &str = "salt";
pub const IDENTITY_FILE: &str = "identity.enc";

#[derive(Debug, Clone)]
pub struct VaultPaths {
    pub root: PathBuf,
    pub db: PathBuf,
    pub salt: PathBuf,
    pub identity: PathBuf,
}

#[derive(Debug)]
pub struct VaultInit {
    pub phrase: String,
    pub keys: KeyMaterial,
    pub paths: VaultPaths,
}

fn vault_error(code: &str, message: &str, details: serde_json::Value) -> AppError {
    AppError::new(code, "vault", message, false, details)
}

pub fn vault_paths(home: &Path) -> VaultPaths {
    VaultPaths {
        root: home.to_path_buf(),
        db: home.join(DB_FILE),
        salt: home.join(SALT_FILE),
        identity: home.join(IDENTITY_FILE),
    }
}

pub fn vault_is_initialized(home: &Path) -> bool {
    let paths = vault_paths(home);
    paths.db.exists() || paths.salt.exists() || paths.identity.exists()
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

pub(crate) fn write_secret_file(path: &Path, bytes: &[u8]) -> AppResult<()> {
    fs::write(path, bytes).map_err(|e| {
        vault_error(
            "MV_VAULT_WRITE_FAILED",
            "failed writing vault secret file",
            serde_json::json!({ "error": e.to_string(), "path": path }),
        )
    })?;
    restrict_to_owner(path).map_err(|e| {
        vault_error(
            "MV_VAULT_WRITE_FAILED",
            "failed restricting vault secret file mode",
            serde_json::json!({ "error": e.to_string(), "path": path }),
        )
    })
}

pub(crate) fn read_salt(paths: &VaultPaths) -> AppResult<[u8; SYMMETRIC_SALT_LEN]> {
    let bytes = fs::read(&paths.salt).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            vault_error(
                "MV_UNINITIALIZED",
                "salt file is missing",
                serde_json::json!({ "path": paths.salt }),
            )
        } else {
            vault_error(
                "MV_VAULT_READ_FAILED",
                "failed reading salt file",
                serde_json::json!({ "error": e.to_string(), "path": paths.salt }),
            )
        }
    })?;
    let salt: [u8; SYMMETRIC_SALT_LEN] = bytes.as_slice().try_into().map_err(|_| {
        vault_error(
            "MV_VAULT_READ_FAILED",
            "salt file has the wrong length",
            serde_json::json!({ "expected": SYMMETRIC_SALT_LEN, "actual": bytes.len() }),
        )
    })?;
    Ok(salt)
}

pub(crate) fn read_identity_blob(paths: &VaultPaths) -> AppResult<Vec<u8>> {
    fs::read(&paths.identity).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            vault_error(
                "MV_UNINITIALIZED",
                "encrypted identity file is missing",
                serde_json::json!({ "path": paths.identity }),
            )
        } else {
            vault_error(
                "MV_VAULT_READ_FAILED",
                "failed reading encrypted identity file",
                serde_json::json!({ "error": e.to_string(), "path": paths.identity }),
            )
        }
    })
}

// Writes the two secret files a home needs besides the database. Also used
// by pull_and_reconstruct when rebuilding a home from the ledger.
pub(crate) fn materialize_identity(
    paths: &VaultPaths,
    salt: &[u8; SYMMETRIC_SALT_LEN],
    sealed_private_key: &[u8],
) -> AppResult<()> {
    fs::create_dir_all(&paths.root).map_err(|e| {
        vault_error(
            "MV_VAULT_WRITE_FAILED",
            "failed creating vault home directory",
            serde_json::json!({ "error": e.to_string(), "path": paths.root }),
        )
    })?;
    write_secret_file(&paths.salt, salt)?;
    write_secret_file(&paths.identity, sealed_private_key)
}

// Fresh home: new phrase, new salt, sealed private key, empty store.
pub fn vault_init(home: &Path, now_ms: i64) -> AppResult<VaultInit> {
    if vault_is_initialized(home) {
        return Err(vault_error(
            "MV_ALREADY_INITIALIZED",
            "vault home already contains local state",
            serde_json::json!({ "path": home }),
        ));
    }

    let paths = vault_paths(home);
    let phrase = phrase::generate_phrase()?;
    let salt = keys::generate_salt()?;
    let key_material = KeyMaterial::derive(&phrase, &salt)?;
    let sealed = key_material.seal_private_key()?;
    materialize_identity(&paths, &salt, &sealed)?;

    let conn = store::open_store(&paths.db)?;
    store::set_meta(&conn, store::META_WALLET_ADDRESS, &key_material.wallet_address)?;
    store::set_meta(&conn, store::META_CURRENT_VERSION, "0")?;
    store::set_meta(&conn, store::META_LAST_PUSHED_VERSION, "0")?;
    store::set_meta(&conn, store::META_INITIALIZED_AT, &timefmt::utc_text(now_ms)?)?;

    Ok(VaultInit {
        phrase,
        keys: key_material,
        paths,
    })
}

// Re-derives key material from the phrase and proves it against the sealed
// private key on disk.
pub fn vault_open(home: &Path, raw_phrase: &str) -> AppResult<(KeyMaterial, VaultPaths)> {
    let paths = vault_paths(home);
    if !paths.db.exists() {
        return Err(vault_error(
            "MV_UNINITIALIZED",
            "vault home has no local database",
            serde_json::json!({ "path": paths.db }),
        ));
    }

    let normalized = phrase::validate_phrase(raw_phrase)?;
    let salt = read_salt(&paths)?;
    let key_material = KeyMaterial::derive(&normalized, &salt)?;

    let sealed = read_identity_blob(&paths)?;
    let private_key = cipher::decrypt(&key_material.symmetric_key, &sealed).map_err(|_| {
        vault_error(
            "MV_BAD_PASSPHRASE",
            "recovery phrase does not decrypt the stored identity",
            serde_json::json!({}),
        )
    })?;
    if !key_material.private_key_matches(&private_key) {
        return Err(vault_error(
            "MV_IDENTITY_MISMATCH",
            "decrypted private key does not match the phrase-derived key",
            serde_json::json!({}),
        ));
    }

    Ok((key_material, paths))
}
