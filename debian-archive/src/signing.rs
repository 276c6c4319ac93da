// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! OpenPGP signing and verification of `Release` documents.

A suite is signed twice. `Release.gpg` holds an armored detached signature over the
exact bytes of `Release`. `InRelease` embeds the same document in the cleartext
signature framework of
[RFC 4880 Section 7](https://datatracker.ietf.org/doc/html/rfc4880.html#section-7):

```text
-----BEGIN PGP SIGNED MESSAGE-----
Hash: SHA512

<dash-escaped document>
-----BEGIN PGP SIGNATURE-----

<signature data>
-----END PGP SIGNATURE-----
```

Verification is against a [Keyring] of trusted public keys. A signature made by a
subkey of a trusted key is accepted.
*/

use {
    crate::{
        error::{ArchiveError, Result},
        hash::{Digester, HashAlgorithm},
    },
    chrono::SubsecRound,
    pgp::{
        armor::{BlockType, Dearmor},
        crypto::{HashAlgorithm as PgpHashAlgorithm, Hasher, SymmetricKeyAlgorithm},
        packet::{Packet, PacketParser, SignatureConfig, SignatureType, Subpacket},
        types::{CompressionAlgorithm, KeyTrait, KeyVersion, PublicKeyTrait, SecretKeyTrait},
        Deserializable, KeyType, SecretKeyParams, SecretKeyParamsBuilder, Signature,
        SignedPublicKey, SignedSecretKey,
    },
    smallvec::{smallvec, SmallVec},
    std::{io::Cursor, path::Path},
};

const HEADER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_ARMOR: &str = "-----BEGIN PGP SIGNATURE-----";

/// A private key used to sign suites.
#[derive(Clone, Debug)]
pub struct SigningKey {
    key: SignedSecretKey,
    passphrase: String,
}

impl SigningKey {
    pub fn new(key: SignedSecretKey, passphrase: impl ToString) -> Self {
        Self {
            key,
            passphrase: passphrase.to_string(),
        }
    }

    /// Load an ASCII armored secret key.
    pub fn from_armored(data: &str, passphrase: Option<&str>) -> Result<Self> {
        let (key, _) = SignedSecretKey::from_armor_single(Cursor::new(data.as_bytes()))?;
        key.verify()?;

        Ok(Self::new(key, passphrase.unwrap_or_default()))
    }

    pub fn from_path(path: impl AsRef<Path>, passphrase: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| ArchiveError::IoPath(format!("{}", path.display()), e))?;

        Self::from_armored(&data, passphrase)
    }

    pub fn secret_key(&self) -> &SignedSecretKey {
        &self.key
    }

    fn signature_config(&self, typ: SignatureType) -> SignatureConfig {
        let hashed_subpackets = vec![
            Subpacket::IssuerFingerprint(
                KeyVersion::V4,
                SmallVec::from_slice(&self.key.fingerprint()),
            ),
            Subpacket::SignatureCreationTime(chrono::Utc::now().trunc_subsecs(0)),
        ];
        let unhashed_subpackets = vec![Subpacket::Issuer(self.key.key_id())];

        SignatureConfig::new_v4(
            Default::default(),
            typ,
            self.key.algorithm(),
            PgpHashAlgorithm::SHA2_512,
            hashed_subpackets,
            unhashed_subpackets,
        )
    }

    fn armor_signature(signature: Signature) -> Result<String> {
        let packet = Packet::Signature(signature);
        let mut writer = Cursor::new(Vec::<u8>::new());
        pgp::armor::write(&packet, BlockType::Signature, &mut writer, None)?;

        String::from_utf8(writer.into_inner())
            .map_err(|e| ArchiveError::Pgp(pgp::errors::Error::Utf8Error(e.utf8_error())))
    }

    /// Produce an armored detached signature over `data`, as stored in `Release.gpg`.
    pub fn detached_sign(&self, data: &[u8]) -> Result<String> {
        let passphrase = self.passphrase.clone();
        let signature = self.signature_config(SignatureType::Binary).sign(
            &self.key,
            move || passphrase,
            Cursor::new(data),
        )?;

        Self::armor_signature(signature)
    }

    /// Wrap `text` in a cleartext signature, as stored in `InRelease`.
    ///
    /// The result uses LF line endings and ends with a newline.
    pub fn clearsign(&self, text: &str) -> Result<String> {
        let mut dashed_lines = vec![];
        let mut source_lines = vec![];

        for line in text.lines() {
            let line = line.trim_end();

            dashed_lines.push(if line.starts_with('-') || line.starts_with("From ") {
                format!("- {}", line)
            } else {
                line.to_string()
            });
            source_lines.push(line);
        }

        let cleartext = source_lines.join("\r\n").into_bytes();

        let passphrase = self.passphrase.clone();
        let signature = self.signature_config(SignatureType::Text).sign(
            &self.key,
            move || passphrase,
            Cursor::new(cleartext),
        )?;

        let lines = [HEADER.to_string(), "Hash: SHA512".to_string(), String::new()]
            .into_iter()
            .chain(dashed_lines.into_iter())
            .chain(std::iter::once(Self::armor_signature(signature)?))
            .collect::<Vec<_>>();

        let mut res = lines.join("\n");
        if !res.ends_with('\n') {
            res.push('\n');
        }

        Ok(res)
    }
}

/// A set of trusted public keys.
#[derive(Clone, Debug, Default)]
pub struct Keyring {
    keys: Vec<SignedPublicKey>,
}

impl Keyring {
    pub fn new(keys: Vec<SignedPublicKey>) -> Self {
        Self { keys }
    }

    pub fn add_key(&mut self, key: SignedPublicKey) {
        self.keys.push(key);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Load keys from one or more ASCII armored public key blocks.
    pub fn from_armored(data: &str) -> Result<Self> {
        let (keys, _) = SignedPublicKey::from_armor_many(Cursor::new(data.as_bytes()))?;

        Self::from_parsed(keys)
    }

    /// Load keys from a binary keyring, such as `debian-archive-keyring.gpg`.
    pub fn from_binary(data: &[u8]) -> Result<Self> {
        Self::from_parsed(SignedPublicKey::from_bytes_many(Cursor::new(data.to_vec())))
    }

    /// Load a keyring file, detecting armored or binary encoding.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data =
            std::fs::read(path).map_err(|e| ArchiveError::IoPath(format!("{}", path.display()), e))?;

        if data.starts_with(b"-----BEGIN") {
            let text = String::from_utf8(data)
                .map_err(|_| ArchiveError::Keyring(format!("{} is not UTF-8", path.display())))?;
            Self::from_armored(&text)
        } else {
            Self::from_binary(&data)
        }
    }

    fn from_parsed(keys: impl Iterator<Item = pgp::errors::Result<SignedPublicKey>>) -> Result<Self> {
        let keys = keys.collect::<pgp::errors::Result<Vec<_>>>()?;

        if keys.is_empty() {
            return Err(ArchiveError::Keyring("no public keys found".into()));
        }

        Ok(Self { keys })
    }

    /// Check a signature against every key and subkey matching its issuer.
    fn verify_signature(&self, signature: &Signature, hasher: &Digester) -> Result<()> {
        let issuer = signature.issuer().ok_or_else(|| {
            ArchiveError::SignatureVerification("signature does not name its issuer".into())
        })?;

        for key in &self.keys {
            if &key.key_id() == issuer {
                return verify_with_key(signature, hasher.clone(), key);
            }

            for subkey in &key.public_subkeys {
                if &subkey.key_id() == issuer {
                    return verify_with_key(signature, hasher.clone(), subkey);
                }
            }
        }

        Err(ArchiveError::SignatureVerification(format!(
            "signature issuer {:?} is not in the keyring",
            issuer
        )))
    }

    /// Require at least one signature to verify against a trusted key.
    ///
    /// `hash_content` feeds the signed content into a digester for the signature's
    /// algorithm.
    fn verify_any(
        &self,
        signatures: &[Signature],
        hash_content: impl Fn(&mut Digester),
    ) -> Result<usize> {
        if signatures.is_empty() {
            return Err(ArchiveError::SignatureVerification(
                "no PGP signatures present".into(),
            ));
        }

        let mut valid = 0;
        let mut last_error = None;

        for signature in signatures {
            let mut hasher = digester_for(signature.config.hash_alg)?;
            hash_content(&mut hasher);

            match self.verify_signature(signature, &hasher) {
                Ok(()) => valid += 1,
                Err(e) => last_error = Some(e),
            }
        }

        match (valid, last_error) {
            (0, Some(e)) => Err(e),
            (0, None) => Err(ArchiveError::SignatureVerification(
                "no signature verified".into(),
            )),
            (n, _) => Ok(n),
        }
    }

    /// Verify a cleartext signed document and return the signed text.
    ///
    /// The returned text has dash escaping reversed and LF line endings.
    pub fn verify_cleartext(&self, data: &str) -> Result<String> {
        let doc = CleartextDocument::parse(data)?;

        self.verify_any(&doc.signatures, |hasher| {
            for (i, line) in doc.lines.iter().enumerate() {
                if i > 0 {
                    hasher.update(b"\r\n");
                }
                hasher.update(line.as_bytes());
            }
        })?;

        Ok(doc.text())
    }

    /// Verify a detached signature over `data`.
    pub fn verify_detached(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        let signatures = parse_signatures(signature)?;

        self.verify_any(&signatures, |hasher| hasher.update(data))?;

        Ok(())
    }
}

fn digester_for(algorithm: PgpHashAlgorithm) -> Result<Digester> {
    match algorithm {
        PgpHashAlgorithm::MD5 => Ok(HashAlgorithm::Md5.new_digester()),
        PgpHashAlgorithm::SHA1 => Ok(HashAlgorithm::Sha1.new_digester()),
        PgpHashAlgorithm::SHA2_256 => Ok(HashAlgorithm::Sha256.new_digester()),
        PgpHashAlgorithm::SHA2_512 => Ok(HashAlgorithm::Sha512.new_digester()),
        a => Err(ArchiveError::SignatureVerification(format!(
            "unsupported signature hash algorithm: {:?}",
            a
        ))),
    }
}

fn verify_with_key(
    signature: &Signature,
    hasher: Digester,
    key: &impl PublicKeyTrait,
) -> Result<()> {
    let mut hasher = Box::new(hasher);

    let len = signature.config.hash_signature_data(&mut *hasher)?;
    hasher.update(&signature.config.trailer(len));

    let digest = hasher.finish();

    if digest.len() < 2 || digest[0..2] != signature.signed_hash_value {
        return Err(ArchiveError::SignatureVerification(
            "invalid signed hash value".into(),
        ));
    }

    key.verify_signature(signature.config.hash_alg, &digest, &signature.signature)
        .map_err(|e| ArchiveError::SignatureVerification(format!("{:?}", e)))
}

/// Parse armored or binary signature packets.
fn parse_signatures(data: &[u8]) -> Result<Vec<Signature>> {
    let packets: Box<dyn Iterator<Item = pgp::errors::Result<Packet>>> =
        if data.starts_with(b"-----BEGIN") {
            let mut dearmor = Dearmor::new(Cursor::new(data.to_vec()));
            dearmor.read_header()?;

            if !matches!(dearmor.typ, Some(BlockType::Signature)) {
                return Err(ArchiveError::CleartextMalformed(
                    "expected PGP signature armor".into(),
                ));
            }

            Box::new(PacketParser::new(dearmor))
        } else {
            Box::new(PacketParser::new(Cursor::new(data.to_vec())))
        };

    packets
        .map(|packet| match packet? {
            Packet::Signature(signature) => Ok(signature),
            packet => Err(ArchiveError::CleartextMalformed(format!(
                "unexpected PGP packet; expected Signature; got {:?}",
                packet.tag()
            ))),
        })
        .collect()
}

/// The pieces of a cleartext signed document.
struct CleartextDocument {
    /// Signed lines with dash escaping reversed and line endings removed.
    lines: Vec<String>,
    signatures: Vec<Signature>,
}

impl CleartextDocument {
    /// Separate signed lines from the armored signature block.
    fn split(data: &str) -> Result<(Vec<String>, String)> {
        let mut lines = data.lines();

        match lines.next() {
            Some(line) if line.trim_end() == HEADER => {}
            _ => {
                return Err(ArchiveError::CleartextMalformed(format!(
                    "expected `{}` header",
                    HEADER
                )))
            }
        }

        // Armor headers such as `Hash: SHA512`, terminated by an empty line.
        loop {
            match lines.next() {
                Some(line) if line.trim().is_empty() => break,
                Some(line) if line.contains(": ") => {}
                Some(line) => {
                    return Err(ArchiveError::CleartextMalformed(format!(
                        "unexpected armor header: {}",
                        line
                    )))
                }
                None => {
                    return Err(ArchiveError::CleartextMalformed(
                        "truncated armor headers".into(),
                    ))
                }
            }
        }

        let mut text = vec![];
        let mut found_signature = false;

        for line in lines.by_ref() {
            if line.trim_end() == SIGNATURE_ARMOR {
                found_signature = true;
                break;
            }

            let line = line.strip_prefix("- ").unwrap_or(line);
            text.push(line.trim_end().to_string());
        }

        if !found_signature {
            return Err(ArchiveError::CleartextMalformed(
                "missing signature armor".into(),
            ));
        }

        let armored = std::iter::once(SIGNATURE_ARMOR)
            .chain(lines)
            .collect::<Vec<_>>()
            .join("\n");

        Ok((text, armored))
    }

    fn parse(data: &str) -> Result<Self> {
        let (lines, armored) = Self::split(data)?;

        Ok(Self {
            lines,
            signatures: parse_signatures(armored.as_bytes())?,
        })
    }

    fn text(&self) -> String {
        let mut s = String::new();
        for line in &self.lines {
            s.push_str(line);
            s.push('\n');
        }

        s
    }
}

/// Extract the signed text of a cleartext document without verifying it.
///
/// Content that is not cleartext signed is returned unchanged. Use this only for
/// content whose integrity is established by other means.
pub fn strip_cleartext_armor(data: &str) -> Result<String> {
    if data.trim_start().starts_with(HEADER) {
        let (lines, _) = CleartextDocument::split(data.trim_start())?;

        Ok(lines.into_iter().map(|line| line + "\n").collect())
    } else {
        Ok(data.to_string())
    }
}

/// Obtain a [SecretKeyParamsBuilder] with defaults suitable for archive signing keys.
///
/// `primary_user_id` has a format like `Name <email>`.
pub fn signing_secret_key_params_builder(primary_user_id: impl ToString) -> SecretKeyParamsBuilder {
    let mut key_params = SecretKeyParamsBuilder::default();
    key_params
        .key_type(KeyType::Rsa(2048))
        .preferred_symmetric_algorithms(smallvec![SymmetricKeyAlgorithm::AES256])
        .preferred_hash_algorithms(smallvec![
            PgpHashAlgorithm::SHA2_256,
            PgpHashAlgorithm::SHA2_384,
            PgpHashAlgorithm::SHA2_512
        ])
        .preferred_compression_algorithms(smallvec![CompressionAlgorithm::ZLIB])
        .can_create_certificates(false)
        .can_sign(true)
        .primary_user_id(primary_user_id.to_string());

    key_params
}

/// Create a self-signed key pair.
///
/// `key_passphrase` returns the passphrase locking the private key.
pub fn create_self_signed_key<PW>(
    params: SecretKeyParams,
    key_passphrase: PW,
) -> pgp::errors::Result<(SignedSecretKey, SignedPublicKey)>
where
    PW: (FnOnce() -> String) + Clone,
{
    let secret_key = params.generate()?;
    let secret_key_signed = secret_key.sign(key_passphrase.clone())?;

    let public_key = secret_key_signed.public_key();
    let public_key_signed = public_key.sign(&secret_key_signed, key_passphrase)?;

    Ok((secret_key_signed, public_key_signed))
}
