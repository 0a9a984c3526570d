//! Swap offers.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use crate::model::ids::{EntityId, TokenId};

/// 100% in fill-ratio units.
pub const FILL_RATIO_FULL: u16 = u16::MAX;

/// Half fill, the most common floor in practice.
pub const FILL_RATIO_HALF: u16 = u16::MAX / 2;

/// Lot size in token base units (0.001 of an 18-decimal token). Offers are
/// quantized to lot multiples so large books stay in integer arithmetic.
pub fn lot_size() -> U256 {
    U256::from(10u64).pow(U256::from(15u64))
}

/// A resting or incoming swap offer on a hub's book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapOffer {
    /// Unique per edge: the placing side's sequence number, low bit encoding
    /// the side.
    pub offer_id: u64,
    /// Entity that placed the offer (the hub's counterparty on that edge).
    pub owner: EntityId,
    pub give_token: TokenId,
    pub give_amount: U256,
    pub want_token: TokenId,
    pub want_amount: U256,
    /// Minimum acceptable immediate fill, in 1/65535ths (65535 = 100%).
    pub min_fill_ratio: u16,
    /// Amounts after lot quantization, fixed at placement.
    pub quantized_give: U256,
    pub quantized_want: U256,
}

impl SwapOffer {
    /// Round both legs down to lot multiples. Returns `None` when either leg
    /// quantizes to zero.
    pub fn quantize(mut self) -> Option<Self> {
        let lot = lot_size();
        self.quantized_give = (self.give_amount / lot) * lot;
        self.quantized_want = (self.want_amount / lot) * lot;
        if self.quantized_give.is_zero() || self.quantized_want.is_zero() {
            None
        } else {
            self.give_amount = self.quantized_give;
            self.want_amount = self.quantized_want;
            Some(self)
        }
    }

    /// The minimum `give` that must fill immediately for the offer to accept
    /// crossing the book: `floor(give * ratio / 65535)`.
    pub fn min_fill_give(&self) -> U256 {
        self.quantized_give * U256::from(self.min_fill_ratio) / U256::from(FILL_RATIO_FULL)
    }
}

/// Ceil-divided want for a partial give fill, so the maker is never
/// undercharged: `ceil(filled_give * want / give)`.
pub fn want_for_fill(filled_give: U256, give: U256, want: U256) -> U256 {
    if give.is_zero() {
        return U256::ZERO;
    }
    (filled_give * want + give - U256::from(1u64)) / give
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth(n: u64) -> U256 {
        U256::from(n) * U256::from(10u64).pow(U256::from(18u64))
    }

    #[test]
    fn quantization_floors_to_lot() {
        let offer = SwapOffer {
            offer_id: 2,
            owner: EntityId::from([1u8; 32]),
            give_token: 1,
            give_amount: eth(5) + U256::from(123u64),
            want_token: 4,
            want_amount: eth(15_250),
            min_fill_ratio: 0,
            quantized_give: U256::ZERO,
            quantized_want: U256::ZERO,
        };
        let q = offer.quantize().unwrap();
        assert_eq!(q.quantized_give, eth(5));
        assert_eq!(q.quantized_want, eth(15_250));

        let dust = SwapOffer {
            give_amount: U256::from(999u64),
            ..q
        };
        assert!(dust.quantize().is_none());
    }

    #[test]
    fn want_rounds_up() {
        // 3 ETH out of 5 at 15,250 want: 9,150 exactly.
        assert_eq!(want_for_fill(eth(3), eth(5), eth(15_250)), eth(9_150));
        // A fill that does not divide evenly rounds against the taker.
        let w = want_for_fill(U256::from(1u64), U256::from(3u64), U256::from(10u64));
        assert_eq!(w, U256::from(4u64));
    }

    #[test]
    fn min_fill_scales_with_ratio() {
        let offer = SwapOffer {
            offer_id: 1,
            owner: EntityId::from([2u8; 32]),
            give_token: 1,
            give_amount: eth(5),
            want_token: 4,
            want_amount: eth(15_250),
            min_fill_ratio: FILL_RATIO_HALF,
            quantized_give: U256::ZERO,
            quantized_want: U256::ZERO,
        }
        .quantize()
        .unwrap();
        // floor(5 ETH * 32767 / 65535) is just shy of 2.5 ETH.
        assert!(offer.min_fill_give() < eth(5) / U256::from(2u64));
        assert!(offer.min_fill_give() > eth(2));
    }
}
