use ethers::types::{Address, Log, H256, U256};
use eyre::{eyre, Result};

/// Event topic0 for:
/// AutoRenewalEnabled(address user, uint256 planId, uint256 maxRenewals, uint256 maxPrice, uint256 authorizedAt)
pub fn enabled_topic0() -> H256 {
    H256::from(ethers::utils::keccak256(
        "AutoRenewalEnabled(address,uint256,uint256,uint256,uint256)",
    ))
}

/// Event topic0 for:
/// AutoRenewalDisabled(address user, uint256 planId, uint256 disabledAt)
pub fn disabled_topic0() -> H256 {
    H256::from(ethers::utils::keccak256(
        "AutoRenewalDisabled(address,uint256,uint256)",
    ))
}

/// Event topic0 for:
/// AutoRenewalExecuted(address user, uint256 planId, uint256 newEndTime, uint256 amountPaid, uint256 remainingRenewals)
pub fn executed_topic0() -> H256 {
    H256::from(ethers::utils::keccak256(
        "AutoRenewalExecuted(address,uint256,uint256,uint256,uint256)",
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnabledEvent {
    pub user: Address,
    pub plan_id: U256,
    pub max_renewals: u32,
    pub max_price: U256,
    pub authorized_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisabledEvent {
    pub user: Address,
    pub plan_id: U256,
    pub disabled_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedEvent {
    pub user: Address,
    pub plan_id: U256,
    pub new_end_time: u64,
    pub amount_paid: U256,
    pub remaining_renewals: u32,
}

/// One decoded auto-renewal event, in the order the chain delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalEvent {
    Enabled(EnabledEvent),
    Disabled(DisabledEvent),
    Executed(ExecutedEvent),
}

/// Decode a raw log into a typed renewal event.
///
/// Returns `Ok(None)` when topic0 is not one of the three tracked selectors.
/// A log that *does* carry a tracked selector but has a malformed payload
/// (wrong word count, dirty address word, out-of-range counter) is an error:
/// we reject the event rather than misread positional fields.
pub fn decode_renewal_event(log: &Log) -> Result<Option<RenewalEvent>> {
    let topic0 = match log.topics.first() {
        Some(t) => *t,
        None => return Ok(None),
    };

    if topic0 == enabled_topic0() {
        // data layout: [user, planId, maxRenewals, maxPrice, authorizedAt]
        let w = data_words(log, 5)?;
        Ok(Some(RenewalEvent::Enabled(EnabledEvent {
            user: address_word(w[0])?,
            plan_id: w[1],
            max_renewals: u32_word(w[2], "maxRenewals")?,
            max_price: w[3],
            authorized_at: u64_word(w[4], "authorizedAt")?,
        })))
    } else if topic0 == disabled_topic0() {
        // data layout: [user, planId, disabledAt]
        let w = data_words(log, 3)?;
        Ok(Some(RenewalEvent::Disabled(DisabledEvent {
            user: address_word(w[0])?,
            plan_id: w[1],
            disabled_at: u64_word(w[2], "disabledAt")?,
        })))
    } else if topic0 == executed_topic0() {
        // data layout: [user, planId, newEndTime, amountPaid, remainingRenewals]
        let w = data_words(log, 5)?;
        Ok(Some(RenewalEvent::Executed(ExecutedEvent {
            user: address_word(w[0])?,
            plan_id: w[1],
            new_end_time: u64_word(w[2], "newEndTime")?,
            amount_paid: w[3],
            remaining_renewals: u32_word(w[4], "remainingRenewals")?,
        })))
    } else {
        Ok(None)
    }
}

/// Split `log.data` into exactly `expected` 32-byte words.
fn data_words(log: &Log, expected: usize) -> Result<Vec<U256>> {
    let data = log.data.as_ref();
    if data.len() != expected * 32 {
        return Err(eyre!(
            "malformed event payload: expected {} words ({} bytes), got {} bytes",
            expected,
            expected * 32,
            data.len()
        ));
    }
    Ok(data
        .chunks_exact(32)
        .map(U256::from_big_endian)
        .collect())
}

fn address_word(word: U256) -> Result<Address> {
    // An address word must fit in the low 20 bytes; anything in the upper
    // 12 bytes means we are looking at the wrong field order.
    if word > U256::from_big_endian(&[0xffu8; 20]) {
        return Err(eyre!("malformed event payload: address word has dirty upper bytes"));
    }
    let mut buf = [0u8; 32];
    word.to_big_endian(&mut buf);
    Ok(Address::from_slice(&buf[12..]))
}

fn u64_word(word: U256, field: &str) -> Result<u64> {
    if word > U256::from(u64::MAX) {
        return Err(eyre!("malformed event payload: {field} exceeds u64::MAX"));
    }
    Ok(word.as_u64())
}

fn u32_word(word: U256, field: &str) -> Result<u32> {
    if word > U256::from(u32::MAX) {
        return Err(eyre!("malformed event payload: {field} exceeds u32::MAX"));
    }
    Ok(word.as_u32())
}
