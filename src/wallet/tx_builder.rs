// Transaction builder

use crate::core::{Transaction, TxInput, TxOutput};
use crate::error::{Error, Result};
use crate::storage::{Blockchain, UtxoSet};
use crate::wallet::KeyPair;

/// Build and sign a transaction paying `amount` from `wallet` to `to`.
/// Any excess over `amount` returns to the sender as change.
pub fn new_utxo_transaction(
    wallet: &KeyPair,
    to: &str,
    amount: u64,
    utxo_set: &UtxoSet,
    chain: &Blockchain,
) -> Result<Transaction> {
    if amount == 0 {
        return Err(Error::Wallet("Amount must be greater than zero".to_string()));
    }
    let payment = TxOutput::to_address(amount, to)?;

    let (accumulated, spendable) = utxo_set.find_spendable(&wallet.pubkey_hash(), amount)?;
    if accumulated < amount {
        return Err(Error::InsufficientFunds {
            available: accumulated,
            required: amount,
        });
    }

    let mut inputs = Vec::new();
    for (txid, indices) in &spendable {
        for index in indices {
            let index = i32::try_from(*index)
                .map_err(|_| Error::Wallet(format!("Output index {} out of range", index)))?;
            inputs.push(TxInput::new(*txid, index, wallet.public_key.clone()));
        }
    }

    let mut outputs = vec![payment];
    if accumulated > amount {
        outputs.push(TxOutput::new(accumulated - amount, wallet.pubkey_hash()));
    }

    let mut tx = Transaction::new(inputs, outputs);
    chain.sign_transaction(&mut tx, &wallet.secret_key)?;

    log::debug!(
        "Built transaction {} spending {} inputs ({} to {}, {} change)",
        tx.id,
        tx.inputs.len(),
        amount,
        to,
        accumulated - amount
    );
    Ok(tx)
}
