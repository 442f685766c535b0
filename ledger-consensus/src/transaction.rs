//! Ledger transactions
//!
//! A transaction consumes previously created outputs (inputs) and creates new
//! ones. Coinbase, reward and gas transactions are generated by producers and
//! consume nothing; contract-send transactions are generated by contract
//! execution and spend contract-owned outputs without a signature.

use crate::utxo::{Utxo, UtxoKind};
use crate::{BlockHeight, ConsensusError, Result};
use ledger_core::crypto::hash;
use ledger_core::{verify_signature, Amount, Hash, OwnerId, Signer};
use serde::{Deserialize, Serialize};

/// Transaction identifier
pub type TxId = Hash;

/// Output index used by inputs of transactions that consume nothing
pub const NO_OUTPUT: u32 = u32::MAX;

/// Kinds of transactions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TransactionType {
    /// Value transfer between owners
    Normal,
    /// Transfer whose first output targets a contract (deploy or invoke)
    Contract,
    /// Block subsidy plus collected tips
    Coinbase,
    /// Minted allocation (genesis distribution)
    Reward,
    /// Gas consumed by contract execution, paid to the producer
    GasReward,
    /// Unused reserved gas, returned to the sender
    GasChange,
    /// Generated by a contract, spends contract-owned outputs
    ContractSend,
}

impl TransactionType {
    /// Special transactions never consume inputs
    pub fn is_special(self) -> bool {
        matches!(
            self,
            TransactionType::Coinbase
                | TransactionType::Reward
                | TransactionType::GasReward
                | TransactionType::GasChange
        )
    }

    /// Only these kinds may come from users
    pub fn is_user_submittable(self) -> bool {
        matches!(self, TransactionType::Normal | TransactionType::Contract)
    }
}

/// Reference to a previous output plus the proof of ownership
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInput {
    pub txid: TxId,
    pub vout: u32,
    /// Signature over the transaction id, or a height commitment for special transactions
    pub signature: Vec<u8>,
    /// Spender's public key, or the contract id bytes for contract-owned outputs
    pub pub_key: Vec<u8>,
}

impl TxInput {
    /// Resolve who owns the referenced output
    pub fn owner(&self) -> Result<OwnerId> {
        if self.pub_key.is_empty() {
            return Err(ConsensusError::InvalidInput("missing public key".to_string()));
        }
        match OwnerId::from_bytes(&self.pub_key) {
            Ok(owner @ OwnerId::Contract(_)) => Ok(owner),
            _ => Ok(OwnerId::from_public_key(&self.pub_key)),
        }
    }

    pub fn outpoint(&self) -> (TxId, u32) {
        (self.txid, self.vout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    pub value: Amount,
    pub owner: OwnerId,
    /// Contract source or invocation payload; empty for plain outputs
    pub contract: String,
}

impl TxOutput {
    pub fn new(value: Amount, owner: OwnerId) -> Self {
        Self {
            value,
            owner,
            contract: String::new(),
        }
    }
}

/// A transaction in the ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: TxId,
    pub tx_type: TransactionType,
    pub vin: Vec<TxInput>,
    pub vout: Vec<TxOutput>,
    /// Fee offered to the producer that includes this transaction
    pub tip: Amount,
    pub gas_limit: Amount,
    pub gas_price: Amount,
}

/// Parameters for [`Transaction::new_transfer`]
#[derive(Debug, Clone)]
pub struct TransferParams {
    pub to: OwnerId,
    pub amount: Amount,
    pub tip: Amount,
    pub gas_limit: Amount,
    pub gas_price: Amount,
    /// Contract payload; a non-empty payload makes this a contract transaction
    pub contract: String,
}

impl TransferParams {
    /// Plain value transfer
    pub fn new(to: OwnerId, amount: Amount, tip: Amount) -> Self {
        Self {
            to,
            amount,
            tip,
            gas_limit: Amount::zero(),
            gas_price: Amount::zero(),
            contract: String::new(),
        }
    }
}

/// Transaction data that is hashed into the id (never includes the id itself)
#[derive(Serialize)]
struct SignableTx<'a> {
    tx_type: TransactionType,
    vin: Vec<SignableInput<'a>>,
    vout: &'a [TxOutput],
    tip: &'a Amount,
    gas_limit: &'a Amount,
    gas_price: &'a Amount,
}

#[derive(Serialize)]
struct SignableInput<'a> {
    txid: &'a TxId,
    vout: u32,
    pub_key: &'a [u8],
    /// Kept only for special transactions, where it carries the height commitment
    commitment: &'a [u8],
}

impl Transaction {
    fn unsigned(tx_type: TransactionType, vin: Vec<TxInput>, vout: Vec<TxOutput>) -> Self {
        Self {
            id: [0u8; 32],
            tx_type,
            vin,
            vout,
            tip: Amount::zero(),
            gas_limit: Amount::zero(),
            gas_price: Amount::zero(),
        }
    }

    fn with_id(mut self) -> Result<Self> {
        self.id = self.hash()?;
        Ok(self)
    }

    /// Input carrying a height commitment instead of a real reference
    fn commitment_input(height: BlockHeight, seq: u32, tag: &[u8]) -> TxInput {
        let mut commitment = height.to_be_bytes().to_vec();
        commitment.extend_from_slice(&seq.to_be_bytes());
        TxInput {
            txid: [0u8; 32],
            vout: NO_OUTPUT,
            signature: commitment,
            pub_key: tag.to_vec(),
        }
    }

    /// Mint the block subsidy plus collected tips to the producer
    pub fn new_coinbase(to: OwnerId, height: BlockHeight, value: Amount) -> Result<Self> {
        let vin = vec![Self::commitment_input(height, 0, b"coinbase")];
        Self::unsigned(TransactionType::Coinbase, vin, vec![TxOutput::new(value, to)]).with_id()
    }

    /// Mint allocations, one output per recipient
    pub fn new_reward(height: BlockHeight, allocations: &[(OwnerId, Amount)]) -> Result<Self> {
        let vin = vec![Self::commitment_input(height, 0, b"reward")];
        let vout = allocations
            .iter()
            .map(|(owner, value)| TxOutput::new(value.clone(), *owner))
            .collect();
        Self::unsigned(TransactionType::Reward, vin, vout).with_id()
    }

    /// Pay consumed gas to the producer; `seq` keeps ids unique within a block
    pub fn new_gas_reward(to: OwnerId, height: BlockHeight, seq: u32, value: Amount) -> Result<Self> {
        let vin = vec![Self::commitment_input(height, seq, b"gas-reward")];
        Self::unsigned(TransactionType::GasReward, vin, vec![TxOutput::new(value, to)]).with_id()
    }

    /// Return unused reserved gas to the sender
    pub fn new_gas_change(to: OwnerId, height: BlockHeight, seq: u32, value: Amount) -> Result<Self> {
        let vin = vec![Self::commitment_input(height, seq, b"gas-change")];
        Self::unsigned(TransactionType::GasChange, vin, vec![TxOutput::new(value, to)]).with_id()
    }

    /// Transaction produced by a contract, spending its own outputs
    pub fn new_contract_send(
        contract: OwnerId,
        outpoints: &[(TxId, u32)],
        vout: Vec<TxOutput>,
    ) -> Result<Self> {
        let contract_bytes = contract.to_bytes();
        let vin = outpoints
            .iter()
            .map(|(txid, vout)| TxInput {
                txid: *txid,
                vout: *vout,
                signature: Vec::new(),
                pub_key: contract_bytes.clone(),
            })
            .collect();
        Self::unsigned(TransactionType::ContractSend, vin, vout).with_id()
    }

    /// Build and sign a transfer spending `utxos`, returning change to the signer.
    ///
    /// The inputs must cover `amount + tip + gas_limit * gas_price`.
    pub fn new_transfer(params: TransferParams, utxos: &[Utxo], signer: &dyn Signer) -> Result<Self> {
        let sender = signer.owner();
        let required = params
            .amount
            .add(&params.tip)
            .add(&params.gas_limit.mul(&params.gas_price));
        let available: Amount = utxos.iter().map(|u| &u.value).sum();
        let change = available
            .sub(&required)
            .map_err(|_| ConsensusError::InsufficientFunds {
                needed: required.clone(),
                available: available.clone(),
            })?;

        let tx_type = if params.contract.is_empty() {
            TransactionType::Normal
        } else {
            TransactionType::Contract
        };
        if tx_type == TransactionType::Contract && !params.to.is_contract() {
            return Err(ConsensusError::InvalidTransaction(
                "contract payload sent to a user owner".to_string(),
            ));
        }

        let vin = utxos
            .iter()
            .map(|u| TxInput {
                txid: u.txid,
                vout: u.tx_index,
                signature: Vec::new(),
                pub_key: signer.public_key().to_vec(),
            })
            .collect();

        let mut vout = vec![TxOutput {
            value: params.amount,
            owner: params.to,
            contract: params.contract,
        }];
        if !change.is_zero() {
            vout.push(TxOutput::new(change, sender));
        }

        let mut tx = Self::unsigned(tx_type, vin, vout);
        tx.tip = params.tip;
        tx.gas_limit = params.gas_limit;
        tx.gas_price = params.gas_price;
        tx.id = tx.hash()?;
        tx.sign(signer)?;
        Ok(tx)
    }

    /// Sign every input with `signer` over the transaction id
    pub fn sign(&mut self, signer: &dyn Signer) -> Result<()> {
        let signature = signer.sign(&self.id)?;
        for input in &mut self.vin {
            input.signature = signature.clone();
        }
        Ok(())
    }

    /// Hash of the transaction contents, excluding spending signatures
    pub fn hash(&self) -> Result<TxId> {
        let special = self.tx_type.is_special();
        let signable = SignableTx {
            tx_type: self.tx_type,
            vin: self
                .vin
                .iter()
                .map(|input| SignableInput {
                    txid: &input.txid,
                    vout: input.vout,
                    pub_key: &input.pub_key,
                    commitment: if special { input.signature.as_slice() } else { &[] },
                })
                .collect(),
            vout: &self.vout,
            tip: &self.tip,
            gas_limit: &self.gas_limit,
            gas_price: &self.gas_price,
        };
        Ok(hash(&bincode::serialize(&signable)?))
    }

    /// Serialized size in bytes, used for pool and block budgets
    pub fn size(&self) -> usize {
        bincode::serialized_size(self).map_or(usize::MAX, |s| usize::try_from(s).unwrap_or(usize::MAX))
    }

    pub fn is_special(&self) -> bool {
        self.tx_type.is_special()
    }

    pub fn is_coinbase(&self) -> bool {
        self.tx_type == TransactionType::Coinbase
    }

    pub fn is_contract(&self) -> bool {
        self.tx_type == TransactionType::Contract
    }

    /// Contract targeted by a contract transaction
    pub fn contract_owner(&self) -> Option<OwnerId> {
        if !self.is_contract() {
            return None;
        }
        self.vout.first().map(|o| o.owner).filter(OwnerId::is_contract)
    }

    /// Owner of the first input, i.e. who receives change and gas refunds
    pub fn sender(&self) -> Result<OwnerId> {
        self.vin
            .first()
            .ok_or_else(|| ConsensusError::InvalidInput("transaction has no inputs".to_string()))?
            .owner()
    }

    pub fn total_output(&self) -> Amount {
        self.vout.iter().map(|o| &o.value).sum()
    }

    /// Value reserved for gas: `gas_limit * gas_price`
    pub fn gas_reserve(&self) -> Amount {
        self.gas_limit.mul(&self.gas_price)
    }

    /// Verify this transaction against the outputs its inputs reference.
    ///
    /// `prev_utxos[i]` must be the output referenced by `vin[i]`.
    pub fn verify(&self, prev_utxos: &[Utxo]) -> Result<()> {
        if self.is_special() {
            return Ok(());
        }
        if self.vin.is_empty() {
            return Err(ConsensusError::InvalidInput("transaction has no inputs".to_string()));
        }
        if prev_utxos.len() != self.vin.len() {
            return Err(ConsensusError::InvalidInput(format!(
                "expected {} referenced outputs, got {}",
                self.vin.len(),
                prev_utxos.len()
            )));
        }
        if self.hash()? != self.id {
            return Err(ConsensusError::InvalidTransaction("id does not match contents".to_string()));
        }

        for (input, utxo) in self.vin.iter().zip(prev_utxos) {
            if input.outpoint() != (utxo.txid, utxo.tx_index) || input.owner()? != utxo.owner {
                return Err(ConsensusError::InvalidInput(format!(
                    "input {}:{} does not match its referenced output",
                    hex::encode(input.txid),
                    input.vout
                )));
            }
            if utxo.kind == UtxoKind::ContractCreate {
                return Err(ConsensusError::InvalidInput(
                    "contract creation outputs cannot be spent".to_string(),
                ));
            }
            match self.tx_type {
                TransactionType::ContractSend => {
                    if !utxo.owner.is_contract() {
                        return Err(ConsensusError::InvalidInput(
                            "contract send spends a user output".to_string(),
                        ));
                    }
                }
                _ => {
                    if !verify_signature(&input.pub_key, &self.id, &input.signature) {
                        return Err(ConsensusError::SignatureMismatch);
                    }
                }
            }
        }

        if self.is_contract() && self.contract_owner().is_none() {
            return Err(ConsensusError::InvalidTransaction(
                "contract transaction does not target a contract".to_string(),
            ));
        }

        let total_in: Amount = prev_utxos.iter().map(|u| &u.value).sum();
        let required = self.total_output().add(&self.tip).add(&self.gas_reserve());
        let excess = total_in.sub(&required)?;
        if !excess.is_zero() {
            return Err(ConsensusError::InvalidTransaction(format!(
                "{} of input value is not accounted for",
                excess
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::{CoreError, KeyPair};

    fn funded_utxo(owner: OwnerId, value: u64, seed: u8) -> Utxo {
        Utxo {
            value: Amount::from_u64(value),
            owner,
            contract: String::new(),
            txid: [seed; 32],
            tx_index: 0,
            kind: UtxoKind::Normal,
        }
    }

    #[test]
    fn test_coinbase_ids_differ_by_height() {
        let owner = OwnerId::from_public_key(b"producer");
        let a = Transaction::new_coinbase(owner, 1, Amount::from_u64(10)).unwrap();
        let b = Transaction::new_coinbase(owner, 2, Amount::from_u64(10)).unwrap();
        assert!(a.is_special());
        assert_ne!(a.id, b.id);
        assert!(a.verify(&[]).is_ok());
    }

    #[test]
    fn test_transfer_sign_and_verify() {
        let keypair = KeyPair::generate();
        let to = OwnerId::from_public_key(b"bob");
        let utxos = vec![funded_utxo(keypair.owner(), 10, 1)];

        let tx = Transaction::new_transfer(
            TransferParams::new(to, Amount::from_u64(7), Amount::from_u64(2)),
            &utxos,
            &keypair,
        )
        .unwrap();

        assert_eq!(tx.vout.len(), 2);
        assert_eq!(tx.vout[1].value, Amount::from_u64(1));
        assert_eq!(tx.sender().unwrap(), keypair.owner());
        tx.verify(&utxos).unwrap();
    }

    #[test]
    fn test_transfer_insufficient_funds() {
        let keypair = KeyPair::generate();
        let utxos = vec![funded_utxo(keypair.owner(), 5, 1)];
        let err = Transaction::new_transfer(
            TransferParams::new(OwnerId::from_public_key(b"x"), Amount::from_u64(5), Amount::from_u64(1)),
            &utxos,
            &keypair,
        )
        .unwrap_err();
        assert!(matches!(err, ConsensusError::InsufficientFunds { .. }));
    }

    #[test]
    fn test_tampered_signature_is_rejected() {
        let keypair = KeyPair::generate();
        let utxos = vec![funded_utxo(keypair.owner(), 10, 1)];
        let mut tx = Transaction::new_transfer(
            TransferParams::new(OwnerId::from_public_key(b"bob"), Amount::from_u64(10), Amount::zero()),
            &utxos,
            &keypair,
        )
        .unwrap();
        tx.vin[0].signature[0] ^= 0xff;
        assert_eq!(tx.verify(&utxos), Err(ConsensusError::SignatureMismatch));
    }

    #[test]
    fn test_overspend_underflows() {
        let keypair = KeyPair::generate();
        let utxos = vec![funded_utxo(keypair.owner(), 10, 1)];
        let mut tx = Transaction::new_transfer(
            TransferParams::new(OwnerId::from_public_key(b"bob"), Amount::from_u64(10), Amount::zero()),
            &utxos,
            &keypair,
        )
        .unwrap();
        tx.vout[0].value = Amount::from_u64(11);
        tx.id = tx.hash().unwrap();
        tx.sign(&keypair).unwrap();
        assert_eq!(tx.verify(&utxos), Err(ConsensusError::Core(CoreError::AmountUnderflow)));
    }

    #[test]
    fn test_spending_someone_elses_output() {
        let keypair = KeyPair::generate();
        let utxos = vec![funded_utxo(OwnerId::from_public_key(b"other"), 10, 1)];
        let tx = Transaction::new_transfer(
            TransferParams::new(OwnerId::from_public_key(b"bob"), Amount::from_u64(10), Amount::zero()),
            &utxos,
            &keypair,
        )
        .unwrap();
        assert!(matches!(tx.verify(&utxos), Err(ConsensusError::InvalidInput(_))));
    }

    #[test]
    fn test_contract_input_owner_resolution() {
        let contract = OwnerId::contract_from_seed(b"c");
        let tx = Transaction::new_contract_send(
            contract,
            &[([9u8; 32], 0)],
            vec![TxOutput::new(Amount::from_u64(1), OwnerId::from_public_key(b"u"))],
        )
        .unwrap();
        assert_eq!(tx.vin[0].owner().unwrap(), contract);
    }

    #[test]
    fn test_contract_payload_requires_contract_owner() {
        let keypair = KeyPair::generate();
        let utxos = vec![funded_utxo(keypair.owner(), 10, 1)];
        let mut params = TransferParams::new(OwnerId::from_public_key(b"bob"), Amount::zero(), Amount::zero());
        params.contract = "call()".to_string();
        assert!(Transaction::new_transfer(params, &utxos, &keypair).is_err());
    }
}
