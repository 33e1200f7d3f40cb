use crate::models::{DomainRegistry, Error};
use aws_lc_rs::{encoding::AsDer, rsa::KeySize, signature::KeyPair};
use mail_auth::{
    common::{
        crypto::{Algorithm, Ed25519Key, RsaKey, Sha256, SigningKey},
        headers::{HeaderWriter, Writable},
    },
    dkim::{DkimSigner, Done},
};
use std::{collections::HashMap, fmt, fs};

/// Headers covered by the DKIM signature.
const SIGNED_HEADERS: [&str; 26] = [
    "From",
    "Subject",
    "Date",
    "Message-ID",
    "To",
    "Cc",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
    "Content-ID",
    "Content-Description",
    "Resent-Date",
    "Resent-From",
    "Resent-Sender",
    "Resent-To",
    "Resent-Cc",
    "Resent-Message-ID",
    "In-Reply-To",
    "References",
    "List-Id",
    "List-Help",
    "List-Unsubscribe",
    "List-Subscribe",
    "List-Post",
    "List-Owner",
    "List-Archive",
];

/// Key material for one signing domain.
pub enum DkimKey {
    Ed25519(aws_lc_rs::signature::Ed25519KeyPair),
    RsaSha256(aws_lc_rs::rsa::KeyPair),
}

impl DkimKey {
    pub fn generate_rsa() -> Result<Self, Error> {
        Ok(Self::RsaSha256(aws_lc_rs::rsa::KeyPair::generate(
            KeySize::Rsa2048,
        )?))
    }

    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, Error> {
        if let Ok(key) = aws_lc_rs::rsa::KeyPair::from_pkcs8(der) {
            return Ok(Self::RsaSha256(key));
        }
        Ok(Self::Ed25519(aws_lc_rs::signature::Ed25519KeyPair::from_pkcs8(der)?))
    }

    /// X.509 DER form of the public half, the value published in DNS.
    pub fn public_key(&self) -> Result<Vec<u8>, Error> {
        let der = match self {
            DkimKey::Ed25519(k) => k.public_key().as_der()?,
            DkimKey::RsaSha256(k) => k.public_key().as_der()?,
        };
        Ok(der.as_ref().to_vec())
    }

    fn signing_key(&self) -> Result<SigningKeyMaterial, Error> {
        match self {
            DkimKey::Ed25519(k) => Ok(SigningKeyMaterial::Ed25519(Ed25519Key::from_pkcs8_der(
                k.to_pkcs8()?.as_ref(),
            )?)),
            DkimKey::RsaSha256(k) => Ok(SigningKeyMaterial::RsaSha256(
                RsaKey::<Sha256>::from_pkcs8_der(k.as_der()?.as_ref())?,
            )),
        }
    }
}

impl fmt::Debug for DkimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DkimKey::Ed25519(_) => write!(f, "DkimKey::Ed25519"),
            DkimKey::RsaSha256(_) => write!(f, "DkimKey::RsaSha256"),
        }
    }
}

pub enum SigningKeyMaterial {
    Ed25519(Ed25519Key),
    RsaSha256(RsaKey<Sha256>),
}

impl SigningKey for SigningKeyMaterial {
    type Hasher = Sha256;

    fn sign(&self, input: impl Writable) -> mail_auth::Result<Vec<u8>> {
        match self {
            SigningKeyMaterial::Ed25519(k) => k.sign(input),
            SigningKeyMaterial::RsaSha256(k) => k.sign(input),
        }
    }

    fn algorithm(&self) -> Algorithm {
        match self {
            SigningKeyMaterial::Ed25519(k) => k.algorithm(),
            SigningKeyMaterial::RsaSha256(k) => k.algorithm(),
        }
    }
}

/// Per-domain DKIM signers. Absence of a signer is not an error: mail from
/// unconfigured domains goes out unsigned.
#[derive(Default)]
pub struct DkimCatalog {
    signers: HashMap<String, DkimSigner<SigningKeyMaterial, Done>>,
}

impl DkimCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_registry(registry: &DomainRegistry, selector: &str) -> Result<Self, Error> {
        let mut catalog = Self::empty();
        for (domain, policy) in registry.iter() {
            if let Some(path) = &policy.dkim_key_file {
                let der = fs::read(path)?;
                catalog.insert(domain, selector, &DkimKey::from_pkcs8_der(&der)?)?;
            }
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, domain: &str, selector: &str, key: &DkimKey) -> Result<(), Error> {
        let signer = DkimSigner::from_key(key.signing_key()?)
            .domain(domain)
            .selector(selector)
            .headers(SIGNED_HEADERS);
        self.signers.insert(domain.to_ascii_lowercase(), signer);
        Ok(())
    }

    fn signer_for(&self, from: &str) -> Option<&DkimSigner<SigningKeyMaterial, Done>> {
        let (_, domain) = from.rsplit_once('@')?;
        self.signers.get(&domain.to_ascii_lowercase())
    }

    /// Sign `data` with the sender domain's key, returning the
    /// `DKIM-Signature` header to prepend. `None` when the domain has no key.
    pub fn sign_header(&self, from: &str, data: &[u8]) -> Option<Result<String, mail_auth::Error>> {
        self.signer_for(from)
            .map(|signer| signer.sign(data).map(|signature| signature.to_header()))
    }
}
