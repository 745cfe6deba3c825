//! Proof of work: recover the origin device key under which the
//! `origin_signature` verifies, searching the globally known candidate set.

use crate::crypto::PublicKey;
use crate::types::Transaction;

/// First matching origin key, or none when the signature matches no known
/// device (the stamp then carries an absent proof).
pub fn find_proof_of_work(tx: &Transaction, origin_keys: &[PublicKey]) -> Option<PublicKey> {
    let message = tx.extended_bytes();
    origin_keys
        .iter()
        .find(|key| key.verify(&message, &tx.origin_signature).is_ok())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{random_keypair, KeyOrigin, PublicKey};
    use crate::types::transaction::TestChain;
    use crate::types::{TransactionData, TransactionType};

    #[test]
    fn search_finds_the_signing_origin_key() {
        let origin = random_keypair();
        let decoy = random_keypair();
        let mut chain = TestChain::new(b"pow");
        let tx = chain.next_transaction(
            TransactionType::Transfer,
            TransactionData::default(),
            1_000,
            &origin,
        );
        let origin_key = PublicKey::from_ed25519(KeyOrigin::Software, &origin.public);
        let decoy_key = PublicKey::from_ed25519(KeyOrigin::Software, &decoy.public);

        let found = find_proof_of_work(&tx, &[decoy_key.clone(), origin_key.clone()]);
        assert_eq!(found, Some(origin_key));

        let missed = find_proof_of_work(&tx, &[decoy_key]);
        assert_eq!(missed, None);
    }
}
