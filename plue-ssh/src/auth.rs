//! Per-session authentication.
//!
//! A session moves `Negotiating → AuthPending → Authenticated | Rejected`.
//! Keys authenticate by SHA-256 fingerprint lookup; certificates by trusted
//! CA, validity window and principal resolution. Whatever the cause, the
//! wire only ever sees [`GENERIC_FAILURE`]; the detailed reason is logged
//! server-side.
use std::time::{SystemTime, UNIX_EPOCH};

use ssh_key::certificate::CertType;
use ssh_key::{Certificate, HashAlg, PublicKey};
use thiserror::Error;

use plue::db;
use plue::identity::UserId;
use plue::keys::{self, DeployBinding, KeyId, KeyType, MinKeySizes};

/// The only authentication failure message ever written to the wire.
pub const GENERIC_FAILURE: &str = "authentication failed";

/// Authentication section of the front-end configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// The single accepted SSH username.
    pub service_user: String,
    pub min_key_sizes: MinKeySizes,
    /// CAs whose user certificates are accepted.
    pub trusted_cas: Vec<PublicKey>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            service_user: "git".to_owned(),
            min_key_sizes: MinKeySizes::default(),
            trusted_cas: Vec::new(),
        }
    }
}

/// What a successful authentication established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    /// `None` for deploy keys.
    pub subject: Option<UserId>,
    pub key: KeyId,
    pub key_type: KeyType,
    pub deploy: Option<DeployBinding>,
}

/// Where a session stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Transport handshake done, nothing offered yet.
    Negotiating,
    /// A credential was offered and is being checked.
    AuthPending,
    Authenticated(AuthInfo),
    Rejected(Reason),
}

/// Internal rejection reason; never sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    InvalidUsername,
    WeakKey,
    KeyNotFound,
    /// Stored content does not match the offered key; a fingerprint
    /// collision is treated as a failure, never resolved by name.
    KeyMismatch,
    UserDisabled,
    NotUserCertificate,
    CertificateExpired,
    CaNotTrusted,
    PrincipalNotFound,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected; `Display` is intentionally generic, matching
    /// [`GENERIC_FAILURE`].
    #[error("authentication failed")]
    Rejected(Reason),
    #[error("authentication backend error: {0}")]
    Backend(#[from] db::Error),
}

impl Error {
    pub fn reason(&self) -> Option<Reason> {
        match self {
            Self::Rejected(reason) => Some(*reason),
            Self::Backend(_) => None,
        }
    }
}

/// Checks offered credentials against the key store.
pub struct Authenticator<'a> {
    store: &'a db::Store,
    config: &'a AuthConfig,
}

impl<'a> Authenticator<'a> {
    pub fn new(store: &'a db::Store, config: &'a AuthConfig) -> Self {
        Self { store, config }
    }

    /// Authenticate an offered public key.
    pub fn public_key(&self, username: &str, key: &PublicKey) -> Result<AuthInfo, Error> {
        self.public_key_at(username, key, unix_now())
    }

    pub(crate) fn public_key_at(
        &self,
        username: &str,
        key: &PublicKey,
        now: i64,
    ) -> Result<AuthInfo, Error> {
        self.check_username(username)?;
        self.config
            .min_key_sizes
            .check(key.key_data())
            .map_err(|err| {
                log::debug!(target: "ssh", "Rejecting key: {err}");
                Error::Rejected(Reason::WeakKey)
            })?;

        let fingerprint = keys::fingerprint(key);
        let Some(stored) = self.store.key_by_fingerprint(&fingerprint)? else {
            return Err(Error::Rejected(Reason::KeyNotFound));
        };
        // The stored content must describe the very key that was offered;
        // matching by fingerprint alone would let a collision through.
        let known = PublicKey::from_openssh(&stored.content).map_err(db::Error::from)?;
        if known.key_data() != key.key_data() {
            return Err(Error::Rejected(Reason::KeyMismatch));
        }

        let info = match stored.key_type {
            KeyType::User => {
                let owner = stored.owner.ok_or(Error::Rejected(Reason::KeyNotFound))?;
                self.check_user(owner)?;
                AuthInfo {
                    subject: Some(owner),
                    key: stored.id,
                    key_type: KeyType::User,
                    deploy: None,
                }
            }
            KeyType::Deploy => AuthInfo {
                subject: None,
                key: stored.id,
                key_type: KeyType::Deploy,
                deploy: stored.deploy,
            },
            // Principal rows are not keys; they can never be offered.
            KeyType::Principal => return Err(Error::Rejected(Reason::KeyNotFound)),
        };
        self.store.touch_key(stored.id, now)?;
        Ok(info)
    }

    /// Authenticate an offered certificate.
    pub fn certificate(&self, username: &str, cert: &Certificate) -> Result<AuthInfo, Error> {
        self.certificate_at(username, cert, unix_now())
    }

    pub(crate) fn certificate_at(
        &self,
        username: &str,
        cert: &Certificate,
        now: i64,
    ) -> Result<AuthInfo, Error> {
        self.check_username(username)?;
        if cert.cert_type() != CertType::User {
            return Err(Error::Rejected(Reason::NotUserCertificate));
        }
        self.config
            .min_key_sizes
            .check(cert.public_key())
            .map_err(|_| Error::Rejected(Reason::WeakKey))?;

        let now_u = u64::try_from(now).unwrap_or(0);
        if now_u < cert.valid_after() || now_u >= cert.valid_before() {
            return Err(Error::Rejected(Reason::CertificateExpired));
        }
        let cas: Vec<ssh_key::Fingerprint> = self
            .config
            .trusted_cas
            .iter()
            .map(|ca| ca.fingerprint(HashAlg::Sha256))
            .collect();
        cert.validate_at(now_u, cas.iter()).map_err(|err| {
            log::debug!(target: "ssh", "Certificate validation failed: {err}");
            Error::Rejected(Reason::CaNotTrusted)
        })?;

        // The first principal that resolves to a known subject wins.
        for principal in cert.valid_principals() {
            let Some(stored) = self.store.principal(principal)? else {
                continue;
            };
            let owner = stored.owner.ok_or(Error::Rejected(Reason::PrincipalNotFound))?;
            self.check_user(owner)?;
            self.store.touch_key(stored.id, now)?;
            return Ok(AuthInfo {
                subject: Some(owner),
                key: stored.id,
                key_type: KeyType::Principal,
                deploy: None,
            });
        }
        Err(Error::Rejected(Reason::PrincipalNotFound))
    }

    fn check_username(&self, username: &str) -> Result<(), Error> {
        if username != self.config.service_user {
            return Err(Error::Rejected(Reason::InvalidUsername));
        }
        Ok(())
    }

    fn check_user(&self, id: UserId) -> Result<(), Error> {
        let user = self
            .store
            .user(id)?
            .ok_or(Error::Rejected(Reason::UserDisabled))?;
        if !user.can_authenticate() {
            return Err(Error::Rejected(Reason::UserDisabled));
        }
        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plue::identity::SubjectId;
    use plue::identity::Visibility;
    use plue::keys::DeployMode;
    use pretty_assertions::assert_eq;
    use ssh_key::rand_core::OsRng;
    use ssh_key::{certificate, Algorithm, PrivateKey};

    const KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIIM1yzzJmnko19XpITUday/RmFUlVSNHcZDQVFyk9tv2 alice";

    fn setup() -> (db::Store, AuthConfig) {
        (db::Store::memory().unwrap(), AuthConfig::default())
    }

    #[test]
    fn test_username_gate() {
        let (store, config) = setup();
        let auth = Authenticator::new(&store, &config);
        let key = PublicKey::from_openssh(KEY).unwrap();
        let err = auth.public_key_at("root", &key, 0).unwrap_err();
        assert_eq!(err.reason(), Some(Reason::InvalidUsername));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let (store, config) = setup();
        let auth = Authenticator::new(&store, &config);
        let key = PublicKey::from_openssh(KEY).unwrap();
        let err = auth.public_key_at("git", &key, 0).unwrap_err();
        assert_eq!(err.reason(), Some(Reason::KeyNotFound));
        assert_eq!(err.to_string(), GENERIC_FAILURE);
    }

    #[test]
    fn test_user_key_authenticates_and_touches() {
        let (store, config) = setup();
        let alice = store.create_user("alice").unwrap();
        let id = store.add_user_key(alice, KEY).unwrap();

        let auth = Authenticator::new(&store, &config);
        let key = PublicKey::from_openssh(KEY).unwrap();
        let info = auth.public_key_at("git", &key, 1_700_000_000).unwrap();
        assert_eq!(
            info,
            AuthInfo {
                subject: Some(alice),
                key: id,
                key_type: KeyType::User,
                deploy: None,
            }
        );

        let stored = store
            .key_by_fingerprint(&keys::fingerprint(&key))
            .unwrap()
            .unwrap();
        assert_eq!(stored.last_used, 1_700_000_000);
    }

    #[test]
    fn test_disabled_user_rejected() {
        let (store, config) = setup();
        let alice = store.create_user("alice").unwrap();
        store.add_user_key(alice, KEY).unwrap();
        store.set_user_prohibit_login(alice, true).unwrap();

        let auth = Authenticator::new(&store, &config);
        let key = PublicKey::from_openssh(KEY).unwrap();
        let err = auth.public_key_at("git", &key, 0).unwrap_err();
        assert_eq!(err.reason(), Some(Reason::UserDisabled));
    }

    #[test]
    fn test_deploy_key_has_no_subject() {
        let (store, config) = setup();
        let owner = store.create_user("owner").unwrap();
        let repo = store
            .create_repo(SubjectId::User(owner), "app", Visibility::Private)
            .unwrap();
        store.add_deploy_key(repo, DeployMode::Read, KEY).unwrap();

        let auth = Authenticator::new(&store, &config);
        let key = PublicKey::from_openssh(KEY).unwrap();
        let info = auth.public_key_at("git", &key, 0).unwrap();
        assert_eq!(info.subject, None);
        assert_eq!(info.key_type, KeyType::Deploy);
        assert_eq!(
            info.deploy,
            Some(DeployBinding {
                repo,
                mode: DeployMode::Read
            })
        );
    }

    fn certificate_for(
        ca: &PrivateKey,
        subject: &PrivateKey,
        principal: &str,
        valid_after: u64,
        valid_before: u64,
    ) -> Certificate {
        let mut builder = certificate::Builder::new_with_random_nonce(
            &mut OsRng,
            subject.public_key().key_data().clone(),
            valid_after,
            valid_before,
        )
        .unwrap();
        builder.cert_type(CertType::User).unwrap();
        builder.valid_principal(principal).unwrap();
        builder.key_id("test-cert").unwrap();
        builder.sign(ca).unwrap()
    }

    #[test]
    fn test_certificate_happy_path() {
        let (store, mut config) = setup();
        let alice = store.create_user("alice").unwrap();
        store.add_principal(alice, "alice@corp").unwrap();

        let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        config.trusted_cas = vec![ca.public_key().clone()];

        let cert = certificate_for(&ca, &subject, "alice@corp", 1_000, 2_000);
        let auth = Authenticator::new(&store, &config);
        let info = auth.certificate_at("git", &cert, 1_500).unwrap();
        assert_eq!(info.subject, Some(alice));
        assert_eq!(info.key_type, KeyType::Principal);
    }

    #[test]
    fn test_certificate_outside_validity_window() {
        let (store, mut config) = setup();
        let alice = store.create_user("alice").unwrap();
        store.add_principal(alice, "alice@corp").unwrap();

        let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        config.trusted_cas = vec![ca.public_key().clone()];

        let cert = certificate_for(&ca, &subject, "alice@corp", 1_000, 2_000);
        let auth = Authenticator::new(&store, &config);
        let err = auth.certificate_at("git", &cert, 3_000).unwrap_err();
        assert_eq!(err.reason(), Some(Reason::CertificateExpired));
    }

    #[test]
    fn test_certificate_from_untrusted_ca() {
        let (store, config) = setup();
        let alice = store.create_user("alice").unwrap();
        store.add_principal(alice, "alice@corp").unwrap();

        let rogue = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();

        let cert = certificate_for(&rogue, &subject, "alice@corp", 1_000, 2_000);
        let auth = Authenticator::new(&store, &config);
        let err = auth.certificate_at("git", &cert, 1_500).unwrap_err();
        assert_eq!(err.reason(), Some(Reason::CaNotTrusted));
    }

    #[test]
    fn test_unknown_principal_rejected() {
        let (store, mut config) = setup();
        let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        config.trusted_cas = vec![ca.public_key().clone()];

        let cert = certificate_for(&ca, &subject, "nobody@corp", 1_000, 2_000);
        let auth = Authenticator::new(&store, &config);
        let err = auth.certificate_at("git", &cert, 1_500).unwrap_err();
        assert_eq!(err.reason(), Some(Reason::PrincipalNotFound));
    }

    #[test]
    fn test_state_progression_shape() {
        // The serve loop drives this enum; make sure equality works for the
        // states it matches on.
        assert_eq!(State::Negotiating, State::Negotiating);
        assert_ne!(State::AuthPending, State::Rejected(Reason::KeyNotFound));
    }
}
