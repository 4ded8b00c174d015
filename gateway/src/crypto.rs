// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Account keys: generation, encryption at rest and transaction signing.
//!
//! Private keys are sealed with AES-256-GCM. The cipher key is derived from
//! the configured secret with HKDF-SHA256 and the stored form is
//! `hex(nonce || ciphertext)`.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address as EthAddress, Eip1559TransactionRequest, H256, U256};
use ethers::utils::keccak256;
use hkdf::Hkdf;
use sha2::Sha256;

use crate::amount::TRANSFER_GAS_LIMIT;
use crate::error::{GatewayError, GatewayResult};
use crate::types::SignedTransfer;

const KEY_DERIVATION_INFO: &[u8] = b"ethgate-account-key";
const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct KeyCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyCipher(..)")
    }
}

impl KeyCipher {
    pub fn new(secret: &str) -> GatewayResult<Self> {
        if secret.is_empty() {
            return Err(GatewayError::ConfigError(
                "private key secret must not be empty".into(),
            ));
        }
        let hk = Hkdf::<Sha256>::new(None, secret.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(KEY_DERIVATION_INFO, &mut key)
            .map_err(|e| GatewayError::CryptoError(format!("HKDF expansion failed: {}", e)))?;
        Ok(Self { key })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> GatewayResult<String> {
        let cipher = Aes256Gcm::new(&self.key.into());
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| GatewayError::CryptoError(format!("Encryption failed: {}", e)))?;
        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(hex::encode(sealed))
    }

    pub fn decrypt(&self, sealed: &str) -> GatewayResult<Vec<u8>> {
        let bytes = hex::decode(sealed)
            .map_err(|e| GatewayError::CryptoError(format!("Malformed sealed key: {}", e)))?;
        if bytes.len() <= NONCE_LEN {
            return Err(GatewayError::CryptoError("Sealed key is truncated".into()));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(&self.key.into());
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| GatewayError::CryptoError(format!("Decryption failed: {}", e)))
    }

    /// Generates a fresh key pair and returns its address with the sealed key.
    pub fn generate_account_key(&self) -> GatewayResult<(EthAddress, String)> {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let sealed = self.encrypt(&wallet.signer().to_bytes())?;
        Ok((wallet.address(), sealed))
    }

    /// Opens a sealed key into a wallet bound to `chain_id`, checking it
    /// still belongs to `expected`.
    pub fn open_wallet(
        &self,
        sealed: &str,
        expected: EthAddress,
        chain_id: u64,
    ) -> GatewayResult<LocalWallet> {
        let key = self.decrypt(sealed)?;
        let wallet = LocalWallet::from_bytes(&key)
            .map_err(|e| GatewayError::CryptoError(format!("Invalid private key: {}", e)))?
            .with_chain_id(chain_id);
        if wallet.address() != expected {
            return Err(GatewayError::CryptoError(format!(
                "Sealed key does not match account {:?}",
                expected
            )));
        }
        Ok(wallet)
    }
}

/// Fee parameters of a dynamic-fee transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferFees {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl TransferFees {
    pub fn new(gas_price: U256, tip_cap: U256) -> Self {
        Self {
            max_fee_per_gas: gas_price,
            max_priority_fee_per_gas: tip_cap.min(gas_price),
        }
    }

    /// Fees for a same-nonce replacement, 12.5% above these.
    pub fn bumped(&self) -> Self {
        let bump = |v: U256| v.saturating_add(v / 8).saturating_add(U256::one());
        Self {
            max_fee_per_gas: bump(self.max_fee_per_gas),
            max_priority_fee_per_gas: bump(self.max_priority_fee_per_gas),
        }
    }
}

pub fn sign_transfer(
    wallet: &LocalWallet,
    to: EthAddress,
    value: U256,
    nonce: u64,
    fees: TransferFees,
) -> GatewayResult<SignedTransfer> {
    let tx: TypedTransaction = Eip1559TransactionRequest::new()
        .from(wallet.address())
        .to(to)
        .value(value)
        .nonce(nonce)
        .gas(TRANSFER_GAS_LIMIT)
        .max_fee_per_gas(fees.max_fee_per_gas)
        .max_priority_fee_per_gas(fees.max_priority_fee_per_gas)
        .chain_id(wallet.chain_id())
        .into();
    let signature = wallet
        .sign_transaction_sync(&tx)
        .map_err(|e| GatewayError::CryptoError(format!("Signing failed: {}", e)))?;
    let raw = tx.rlp_signed(&signature);
    let hash = H256::from(keccak256(&raw));
    Ok(SignedTransfer {
        raw,
        hash,
        from: wallet.address(),
        to,
        value,
        nonce,
        gas_price: fees.max_fee_per_gas,
    })
}
