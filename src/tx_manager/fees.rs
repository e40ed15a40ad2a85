use serde::Serialize;

use crate::rpc_manager::FeeData;

use super::manager::TransactionConfig;

/// Fee fields of an outgoing transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeeParams {
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
    Legacy {
        gas_price: u128,
    },
}

/// Network fees are padded by this percentage
const NETWORK_FEE_MARGIN_PERCENT: u32 = 10;

fn scale(value: u128, percent: u32) -> u128 {
    value.saturating_mul(u128::from(100 + percent)) / 100
}

impl FeeParams {
    /// Choose fees from network data and per-call overrides.
    ///
    /// EIP-1559 when the network reports both fields, legacy gas price
    /// otherwise, `default_gas_price` when fee data is missing entirely.
    pub fn resolve(fee_data: Option<&FeeData>, config: &TransactionConfig, default_gas_price: u128) -> Self {
        match fee_data {
            Some(FeeData {
                max_fee_per_gas: Some(max_fee),
                max_priority_fee_per_gas: Some(priority),
                ..
            }) => FeeParams::Eip1559 {
                max_fee_per_gas: config
                    .max_fee_per_gas
                    .unwrap_or_else(|| scale(*max_fee, NETWORK_FEE_MARGIN_PERCENT)),
                max_priority_fee_per_gas: config.max_priority_fee_per_gas.unwrap_or(*priority),
            },
            Some(FeeData {
                gas_price: Some(gas_price),
                ..
            }) => FeeParams::Legacy {
                gas_price: config
                    .gas_price
                    .unwrap_or_else(|| scale(*gas_price, NETWORK_FEE_MARGIN_PERCENT)),
            },
            _ => FeeParams::Legacy {
                gas_price: config.gas_price.unwrap_or(default_gas_price),
            },
        }
    }

    /// Raise every fee field by `percent`, as required to replace a pending
    /// transaction with the same nonce
    pub fn bump(self, percent: u32) -> Self {
        match self {
            FeeParams::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => FeeParams::Eip1559 {
                max_fee_per_gas: scale(max_fee_per_gas, percent),
                max_priority_fee_per_gas: scale(max_priority_fee_per_gas, percent),
            },
            FeeParams::Legacy { gas_price } => FeeParams::Legacy {
                gas_price: scale(gas_price, percent),
            },
        }
    }

    /// Highest price per gas the sender may pay
    pub fn max_price_per_gas(&self) -> u128 {
        match self {
            FeeParams::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
            FeeParams::Legacy { gas_price } => *gas_price,
        }
    }

    /// Component-wise maximum, so a replacement never underprices the original
    pub fn at_least(self, floor: FeeParams) -> Self {
        match (self, floor) {
            (
                FeeParams::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                },
                FeeParams::Eip1559 {
                    max_fee_per_gas: floor_fee,
                    max_priority_fee_per_gas: floor_priority,
                },
            ) => FeeParams::Eip1559 {
                max_fee_per_gas: max_fee_per_gas.max(floor_fee),
                max_priority_fee_per_gas: max_priority_fee_per_gas.max(floor_priority),
            },
            (FeeParams::Legacy { gas_price }, FeeParams::Legacy { gas_price: floor_price }) => {
                FeeParams::Legacy {
                    gas_price: gas_price.max(floor_price),
                }
            }
            // Fee model changed between attempts; keep the bumped previous fees.
            (_, floor) => floor,
        }
    }
}
