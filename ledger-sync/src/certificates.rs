//! Certificate normalization
//!
//! Turns chain certificates into (kind, payload, relations) rows. The
//! delegator's reward address is always stored and resolved directly. Raw key
//! hashes (pool owners, operators, pool keys, governance credentials) are
//! matched against stored addresses by rebuilding the reward address and
//! then the enterprise address of the key; when neither is stored the
//! relation is dropped.

use crate::remote::RemoteCertificate;
use crate::{Error, Result};
use ledger_storage_sqlite::{AddressId, CertificateKind, CertificateRole, NewCertificate};
use std::collections::HashMap;
use tracing::debug;

const KEY_HASH_LEN: usize = 28;
const REWARD_HEADER: u8 = 0xe0;
const ENTERPRISE_HEADER: u8 = 0x60;

/// Kind of a chain certificate
pub fn kind_of(cert: &RemoteCertificate) -> CertificateKind {
    use RemoteCertificate as C;
    match cert {
        C::StakeRegistration { .. } => CertificateKind::StakeRegistration,
        C::StakeDeregistration { .. } => CertificateKind::StakeDeregistration,
        C::StakeDelegation { .. } => CertificateKind::StakeDelegation,
        C::PoolRegistration { .. } => CertificateKind::PoolRegistration,
        C::PoolRetirement { .. } => CertificateKind::PoolRetirement,
        C::GenesisKeyDelegation { .. } => CertificateKind::GenesisKeyDelegation,
        C::MoveInstantaneousRewards { .. } => CertificateKind::MoveInstantaneousRewards,
        C::RegistrationWithDeposit { .. } => CertificateKind::RegistrationWithDeposit,
        C::DeregistrationWithRefund { .. } => CertificateKind::DeregistrationWithRefund,
        C::VoteDelegation { .. } => CertificateKind::VoteDelegation,
        C::StakeVoteDelegation { .. } => CertificateKind::StakeVoteDelegation,
        C::StakeRegistrationDelegation { .. } => CertificateKind::StakeRegistrationDelegation,
        C::VoteRegistrationDelegation { .. } => CertificateKind::VoteRegistrationDelegation,
        C::StakeVoteRegistrationDelegation { .. } => {
            CertificateKind::StakeVoteRegistrationDelegation
        }
        C::AuthCommitteeHot { .. } => CertificateKind::AuthCommitteeHot,
        C::ResignCommitteeCold { .. } => CertificateKind::ResignCommitteeCold,
        C::DrepRegistration { .. } => CertificateKind::DrepRegistration,
        C::DrepDeregistration { .. } => CertificateKind::DrepDeregistration,
        C::DrepUpdate { .. } => CertificateKind::DrepUpdate,
    }
}

/// Addresses a certificate names directly; they are stored with the
/// transaction like any input or output address
pub fn direct_addresses(cert: &RemoteCertificate) -> Vec<(String, CertificateRole)> {
    use RemoteCertificate as C;
    match cert {
        C::StakeRegistration { stake_credential }
        | C::StakeDeregistration { stake_credential }
        | C::StakeDelegation { stake_credential, .. }
        | C::RegistrationWithDeposit { stake_credential, .. }
        | C::DeregistrationWithRefund { stake_credential, .. }
        | C::VoteDelegation { stake_credential, .. }
        | C::StakeVoteDelegation { stake_credential, .. }
        | C::StakeRegistrationDelegation { stake_credential, .. }
        | C::VoteRegistrationDelegation { stake_credential, .. }
        | C::StakeVoteRegistrationDelegation { stake_credential, .. } => {
            vec![(stake_credential.clone(), CertificateRole::RewardAddress)]
        }
        C::PoolRegistration { pool_params } => vec![(
            pool_params.reward_account.clone(),
            CertificateRole::RewardAddress,
        )],
        C::MoveInstantaneousRewards { rewards, .. } => rewards
            .keys()
            .map(|address| (address.clone(), CertificateRole::RewardAddress))
            .collect(),
        C::PoolRetirement { .. }
        | C::GenesisKeyDelegation { .. }
        | C::AuthCommitteeHot { .. }
        | C::ResignCommitteeCold { .. }
        | C::DrepRegistration { .. }
        | C::DrepDeregistration { .. }
        | C::DrepUpdate { .. } => Vec::new(),
    }
}

/// Raw key hashes a certificate names, with the role they play
pub fn key_hashes(cert: &RemoteCertificate) -> Vec<(String, CertificateRole)> {
    use RemoteCertificate as C;
    match cert {
        C::StakeDelegation { pool_keyhash, .. }
        | C::StakeVoteDelegation { pool_keyhash, .. }
        | C::StakeRegistrationDelegation { pool_keyhash, .. }
        | C::StakeVoteRegistrationDelegation { pool_keyhash, .. } => {
            vec![(pool_keyhash.clone(), CertificateRole::PoolKey)]
        }
        C::PoolRegistration { pool_params } => {
            let mut keys = vec![(pool_params.operator.clone(), CertificateRole::Operator)];
            keys.extend(
                pool_params
                    .pool_owners
                    .iter()
                    .map(|owner| (owner.clone(), CertificateRole::Owner)),
            );
            keys
        }
        C::PoolRetirement { pool_keyhash, .. } => {
            vec![(pool_keyhash.clone(), CertificateRole::Operator)]
        }
        C::AuthCommitteeHot {
            committee_cold_keyhash,
            ..
        }
        | C::ResignCommitteeCold {
            committee_cold_keyhash,
            ..
        } => vec![(committee_cold_keyhash.clone(), CertificateRole::Signer)],
        C::DrepRegistration { drep_keyhash, .. }
        | C::DrepDeregistration { drep_keyhash, .. }
        | C::DrepUpdate { drep_keyhash, .. } => {
            vec![(drep_keyhash.clone(), CertificateRole::Signer)]
        }
        C::StakeRegistration { .. }
        | C::StakeDeregistration { .. }
        | C::GenesisKeyDelegation { .. }
        | C::MoveInstantaneousRewards { .. }
        | C::RegistrationWithDeposit { .. }
        | C::DeregistrationWithRefund { .. }
        | C::VoteDelegation { .. }
        | C::VoteRegistrationDelegation { .. } => Vec::new(),
    }
}

/// Reward then enterprise address (hex) for a 28-byte key hash
pub fn candidate_addresses(key_hash: &str, network_tag: u8) -> Result<[String; 2]> {
    let key = hex::decode(key_hash)
        .map_err(|_| Error::Validation(format!("malformed key hash {key_hash}")))?;
    if key.len() != KEY_HASH_LEN {
        return Err(Error::Validation(format!(
            "key hash {key_hash} is {} bytes, expected {KEY_HASH_LEN}",
            key.len()
        )));
    }
    let with_header = |header: u8| {
        let mut bytes = Vec::with_capacity(KEY_HASH_LEN + 1);
        bytes.push(header | (network_tag & 0x0f));
        bytes.extend_from_slice(&key);
        hex::encode(bytes)
    };
    Ok([with_header(REWARD_HEADER), with_header(ENTERPRISE_HEADER)])
}

/// Maps chain certificates onto storage rows
pub struct CertificateNormalizer<'a> {
    network_tag: u8,
    addresses: &'a HashMap<String, AddressId>,
}

impl<'a> CertificateNormalizer<'a> {
    /// `addresses` must hold every direct address of the certificates to
    /// normalize, plus whichever reconstructed key addresses are stored
    pub fn new(network_tag: u8, addresses: &'a HashMap<String, AddressId>) -> Self {
        Self {
            network_tag,
            addresses,
        }
    }

    /// Every reconstructed address worth looking up for `certs`
    pub fn lookup_candidates(network_tag: u8, certs: &[RemoteCertificate]) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for cert in certs {
            for (key, _) in key_hashes(cert) {
                out.extend(candidate_addresses(&key, network_tag)?);
            }
        }
        Ok(out)
    }

    /// Normalize the certificate at `ordinal`
    pub fn normalize(&self, ordinal: u32, cert: &RemoteCertificate) -> Result<NewCertificate> {
        let mut relations = Vec::new();
        for (address, role) in direct_addresses(cert) {
            let id = self.addresses.get(&address).ok_or_else(|| {
                Error::StaleState(format!("certificate address {address} was not stored"))
            })?;
            relations.push((*id, role));
        }
        for (key, role) in key_hashes(cert) {
            let [reward, enterprise] = candidate_addresses(&key, self.network_tag)?;
            match self
                .addresses
                .get(&reward)
                .or_else(|| self.addresses.get(&enterprise))
            {
                Some(id) => relations.push((*id, role)),
                None => debug!(key = %key, ?role, "Certificate key matches no known address"),
            }
        }

        Ok(NewCertificate {
            ordinal,
            kind: kind_of(cert),
            payload: serde_json::to_value(cert)
                .map_err(|e| Error::Validation(format!("certificate payload: {e}")))?,
            relations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::PoolParams;

    const TAG: u8 = 1;

    fn key(n: u8) -> String {
        hex::encode([n; 28])
    }

    fn reward(n: u8) -> String {
        format!("e1{}", key(n))
    }

    #[test]
    fn test_candidates_follow_header_layout() {
        let [reward_addr, enterprise] = candidate_addresses(&key(3), TAG).unwrap();
        assert_eq!(reward_addr, reward(3));
        assert_eq!(enterprise, format!("61{}", key(3)));
        assert!(candidate_addresses("zz", TAG).is_err());
        assert!(candidate_addresses(&hex::encode([1u8; 20]), TAG).is_err());
    }

    #[test]
    fn test_delegation_resolves_reward_address_and_pool_key() {
        let addresses: HashMap<String, AddressId> =
            [(reward(1), 10), (format!("61{}", key(2)), 20)].into_iter().collect();
        let normalizer = CertificateNormalizer::new(TAG, &addresses);
        let cert = RemoteCertificate::StakeDelegation {
            stake_credential: reward(1),
            pool_keyhash: key(2),
        };

        let row = normalizer.normalize(0, &cert).unwrap();
        assert_eq!(row.kind, CertificateKind::StakeDelegation);
        assert_eq!(
            row.relations,
            vec![(10, CertificateRole::RewardAddress), (20, CertificateRole::PoolKey)]
        );
        assert_eq!(row.payload["kind"], "stake_delegation");
    }

    #[test]
    fn test_unknown_owner_is_omitted() {
        let addresses: HashMap<String, AddressId> =
            [(reward(5), 50), (reward(6), 60)].into_iter().collect();
        let normalizer = CertificateNormalizer::new(TAG, &addresses);
        let cert = RemoteCertificate::PoolRegistration {
            pool_params: PoolParams {
                operator: key(6),
                vrf_keyhash: String::new(),
                pledge: "0".into(),
                cost: "340".into(),
                margin: "0".into(),
                reward_account: reward(5),
                pool_owners: vec![key(7), key(6)],
                extra: None,
            },
        };

        let row = normalizer.normalize(2, &cert).unwrap();
        assert_eq!(row.ordinal, 2);
        assert_eq!(
            row.relations,
            vec![
                (50, CertificateRole::RewardAddress),
                (60, CertificateRole::Operator),
                (60, CertificateRole::Owner),
            ]
        );
    }

    #[test]
    fn test_missing_direct_address_is_stale_state() {
        let addresses = HashMap::new();
        let normalizer = CertificateNormalizer::new(TAG, &addresses);
        let cert = RemoteCertificate::StakeRegistration {
            stake_credential: reward(9),
        };
        assert!(matches!(
            normalizer.normalize(0, &cert),
            Err(Error::StaleState(_))
        ));
    }

    #[test]
    fn test_every_kind_maps() {
        let certs = vec![
            RemoteCertificate::GenesisKeyDelegation {
                genesis_hash: "a".into(),
                genesis_delegate_hash: "b".into(),
                vrf_keyhash: "c".into(),
            },
            RemoteCertificate::DrepUpdate {
                drep_keyhash: key(1),
                anchor: None,
            },
        ];
        assert_eq!(kind_of(&certs[0]), CertificateKind::GenesisKeyDelegation);
        assert_eq!(kind_of(&certs[1]), CertificateKind::DrepUpdate);
        let candidates = CertificateNormalizer::lookup_candidates(TAG, &certs).unwrap();
        assert_eq!(candidates.len(), 2);
    }
}
