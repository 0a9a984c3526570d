//! Hub-hosted price-time orderbook over swap offers.
//!
//! One book per canonical token pair `(base, quote) = (min, max)`. Sides are
//! kept as parallel primitive arrays so large books stay cache-coherent; the
//! arrays are price-time sorted at insertion. Matching executes at the
//! resting (maker) price, ceil-rounded on the maker's want side so the maker
//! is never undercharged.
//!
//! The book is hub-local state: fills only become real when the hub commits
//! the resulting transfer txs bilaterally on the taker and maker edges.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use crate::errors::AdmissionError;
use crate::model::ids::{EntityId, TokenId};
use crate::model::offer::{lot_size, want_for_fill, SwapOffer};

/// One executed overlap between an incoming and a resting offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchFill {
    pub maker: EntityId,
    pub maker_offer_id: u64,
    pub taker: EntityId,
    pub taker_offer_id: u64,
    pub base_token: TokenId,
    pub quote_token: TokenId,
    /// Base moved from the selling to the buying side.
    pub base_amount: U256,
    /// Quote moved the other way, at the maker's price.
    pub quote_amount: U256,
}

/// Parallel arrays for one side of a book, price-time sorted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideArrays {
    pub owners: Vec<EntityId>,
    pub offer_ids: Vec<u64>,
    /// Remaining give leg (base for asks, quote for bids).
    pub gives: Vec<U256>,
    /// Remaining want leg.
    pub wants: Vec<U256>,
    pub seqs: Vec<u64>,
}

impl SideArrays {
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    fn insert_at(&mut self, idx: usize, owner: EntityId, offer_id: u64, give: U256, want: U256, seq: u64) {
        self.owners.insert(idx, owner);
        self.offer_ids.insert(idx, offer_id);
        self.gives.insert(idx, give);
        self.wants.insert(idx, want);
        self.seqs.insert(idx, seq);
    }

    fn remove(&mut self, idx: usize) {
        self.owners.remove(idx);
        self.offer_ids.remove(idx);
        self.gives.remove(idx);
        self.wants.remove(idx);
        self.seqs.remove(idx);
    }

    fn position_of(&self, owner: EntityId, offer_id: u64) -> Option<usize> {
        (0..self.len()).find(|&i| self.owners[i] == owner && self.offer_ids[i] == offer_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub base: TokenId,
    pub quote: TokenId,
    /// Give quote, want base; best (highest) price first.
    pub bids: SideArrays,
    /// Give base, want quote; best (lowest) price first.
    pub asks: SideArrays,
}

/// `a/b >= c/d` without division: `a*d >= c*b`. Operands are lot-quantized
/// token amounts, far below the half-width where the cross product could
/// wrap.
fn ratio_ge(a: U256, b: U256, c: U256, d: U256) -> bool {
    a * d >= c * b
}

impl Book {
    fn new(base: TokenId, quote: TokenId) -> Self {
        Self {
            base,
            quote,
            bids: SideArrays::default(),
            asks: SideArrays::default(),
        }
    }

    /// Bid sort key: price desc (give_quote/want_base), then seq asc.
    fn bid_insert_pos(&self, give: U256, want: U256) -> usize {
        (0..self.bids.len())
            .find(|&i| !ratio_ge(self.bids.gives[i], self.bids.wants[i], give, want))
            .unwrap_or(self.bids.len())
    }

    /// Ask sort key: price asc (want_quote/give_base), then seq asc.
    fn ask_insert_pos(&self, give: U256, want: U256) -> usize {
        (0..self.asks.len())
            .find(|&i| !ratio_ge(want, give, self.asks.wants[i], self.asks.gives[i]))
            .unwrap_or(self.asks.len())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Orderbook {
    pub books: Vec<Book>,
    pub seq: u64,
}

impl Orderbook {
    pub fn new(pairs: &[(TokenId, TokenId)]) -> Self {
        let mut ob = Self::default();
        for (a, b) in pairs {
            ob.ensure_book(*a, *b);
        }
        ob
    }

    pub fn ensure_book(&mut self, a: TokenId, b: TokenId) {
        let (base, quote) = if a < b { (a, b) } else { (b, a) };
        if !self.books.iter().any(|bk| bk.base == base && bk.quote == quote) {
            self.books.push(Book::new(base, quote));
        }
    }

    pub fn book(&self, a: TokenId, b: TokenId) -> Option<&Book> {
        let (base, quote) = if a < b { (a, b) } else { (b, a) };
        self.books.iter().find(|bk| bk.base == base && bk.quote == quote)
    }

    fn book_mut(&mut self, a: TokenId, b: TokenId) -> Option<&mut Book> {
        let (base, quote) = if a < b { (a, b) } else { (b, a) };
        self.books
            .iter_mut()
            .find(|bk| bk.base == base && bk.quote == quote)
    }

    /// Place a quantized offer: match the crossing overlap, then rest any
    /// remainder at or above the lot floor.
    ///
    /// If the immediately fillable give is below the offer's minimum fill,
    /// nothing executes and the whole offer rests.
    pub fn place(&mut self, offer: &SwapOffer) -> Result<Vec<MatchFill>, AdmissionError> {
        let seq = self.seq;
        self.seq += 1;

        let book = self
            .book_mut(offer.give_token, offer.want_token)
            .ok_or(AdmissionError::UnknownPair(
                offer.give_token.min(offer.want_token),
                offer.give_token.max(offer.want_token),
            ))?;

        let incoming_is_ask = offer.give_token == book.base;
        let lot = lot_size();

        let mut give_left = offer.quantized_give;
        let mut want_left = offer.quantized_want;
        let mut fills: Vec<MatchFill> = Vec::new();

        // Walk the opposite side best-first for the crossing overlap.
        let mut planned: Vec<(usize, U256, U256)> = Vec::new(); // (idx, base, quote)
        {
            let opposite = if incoming_is_ask { &book.bids } else { &book.asks };
            let mut g = give_left;
            let mut w = want_left;
            for i in 0..opposite.len() {
                if g.is_zero() || w.is_zero() {
                    break;
                }
                let (rest_give, rest_want) = (opposite.gives[i], opposite.wants[i]);
                let crosses = if incoming_is_ask {
                    // Resting bid price >= incoming ask price.
                    ratio_ge(rest_give, rest_want, w, g)
                } else {
                    // Incoming bid price >= resting ask price.
                    ratio_ge(g, w, rest_want, rest_give)
                };
                if !crosses {
                    break;
                }

                let (base_fill, quote_fill) = if incoming_is_ask {
                    // Incoming gives base; resting bid wants base.
                    let f = g.min(rest_want);
                    // Maker gives quote for f base; floor protects the maker.
                    let q = f * rest_give / rest_want;
                    (f, q)
                } else {
                    // Incoming gives quote; resting ask gives base.
                    let f = w.min(rest_give);
                    // Taker pays the maker's price, ceil on the maker's want.
                    let q = want_for_fill(f, rest_give, rest_want);
                    (f, q)
                };
                if base_fill.is_zero() {
                    break;
                }
                planned.push((i, base_fill, quote_fill));
                if incoming_is_ask {
                    g -= base_fill;
                    w = w.saturating_sub(quote_fill);
                } else {
                    g = g.saturating_sub(quote_fill);
                    w -= base_fill;
                }
            }
        }

        // The taker aborts rather than under-filling its minimum.
        let fillable_give: U256 = planned
            .iter()
            .map(|(_, base, quote)| if incoming_is_ask { *base } else { *quote })
            .fold(U256::ZERO, |acc, v| acc + v);
        if !planned.is_empty() && fillable_give < offer.min_fill_give() {
            planned.clear();
        }

        // Execute planned fills back-to-front so removals keep indices valid.
        for (idx, base_fill, quote_fill) in planned.iter().rev() {
            let opposite = if incoming_is_ask {
                &mut book.bids
            } else {
                &mut book.asks
            };
            let maker = opposite.owners[*idx];
            let maker_offer_id = opposite.offer_ids[*idx];
            if incoming_is_ask {
                // Resting bid: give quote, want base.
                opposite.gives[*idx] -= *quote_fill;
                opposite.wants[*idx] -= *base_fill;
            } else {
                opposite.gives[*idx] -= *base_fill;
                opposite.wants[*idx] -= *quote_fill;
            }
            if opposite.gives[*idx] < lot || opposite.wants[*idx] < lot {
                opposite.remove(*idx);
            }
            fills.push(MatchFill {
                maker,
                maker_offer_id,
                taker: offer.owner,
                taker_offer_id: offer.offer_id,
                base_token: book.base,
                quote_token: book.quote,
                base_amount: *base_fill,
                quote_amount: *quote_fill,
            });
        }
        fills.reverse();

        // The remainder rests at the offer's own limit price: price
        // improvement received on the filled part must not tilt the rest.
        // Rounding protects the owner (ceil on want, floor on give).
        for f in &fills {
            if incoming_is_ask {
                give_left -= f.base_amount;
            } else {
                want_left -= f.base_amount;
            }
        }
        if incoming_is_ask {
            want_left = want_for_fill(give_left, offer.quantized_give, offer.quantized_want);
        } else if !offer.quantized_want.is_zero() {
            give_left = want_left * offer.quantized_give / offer.quantized_want;
        }

        // Rest the remainder unless a leg fell below the lot floor.
        if give_left >= lot && want_left >= lot {
            if incoming_is_ask {
                let pos = book.ask_insert_pos(give_left, want_left);
                book.asks
                    .insert_at(pos, offer.owner, offer.offer_id, give_left, want_left, seq);
            } else {
                let pos = book.bid_insert_pos(give_left, want_left);
                book.bids
                    .insert_at(pos, offer.owner, offer.offer_id, give_left, want_left, seq);
            }
        }

        Ok(fills)
    }

    /// Remove a resting offer. Only the poster's entries are searched.
    pub fn cancel(
        &mut self,
        owner: EntityId,
        give_token: TokenId,
        want_token: TokenId,
        offer_id: u64,
    ) -> bool {
        let Some(book) = self.book_mut(give_token, want_token) else {
            return false;
        };
        if let Some(i) = book.asks.position_of(owner, offer_id) {
            book.asks.remove(i);
            return true;
        }
        if let Some(i) = book.bids.position_of(owner, offer_id) {
            book.bids.remove(i);
            return true;
        }
        false
    }

    /// Remaining give on a resting offer, if any.
    pub fn resting_give(&self, give_token: TokenId, want_token: TokenId, owner: EntityId, offer_id: u64) -> Option<U256> {
        let book = self.book(give_token, want_token)?;
        let side = if give_token == book.base { &book.asks } else { &book.bids };
        side.position_of(owner, offer_id).map(|i| side.gives[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::offer::{FILL_RATIO_HALF};
    use alloy::primitives::B256;

    const ETH: TokenId = 1;
    const USDC: TokenId = 4;

    fn amt(n: u64) -> U256 {
        U256::from(n) * U256::from(10u64).pow(U256::from(18u64))
    }

    fn offer(
        owner_byte: u8,
        id: u64,
        give: TokenId,
        give_n: u64,
        want: TokenId,
        want_n: u64,
        min_fill: u16,
    ) -> SwapOffer {
        SwapOffer {
            offer_id: id,
            owner: B256::from([owner_byte; 32]),
            give_token: give,
            give_amount: amt(give_n),
            want_token: want,
            want_amount: amt(want_n),
            min_fill_ratio: min_fill,
            quantized_give: U256::ZERO,
            quantized_want: U256::ZERO,
        }
        .quantize()
        .unwrap()
    }

    #[test]
    fn crossing_bid_fills_at_maker_price() {
        let mut ob = Orderbook::new(&[(ETH, USDC)]);

        // Bob asks 5 ETH for 15,250 USDC (3,050/ETH), half fill minimum.
        let bob = offer(2, 2, ETH, 5, USDC, 15_250, FILL_RATIO_HALF);
        assert!(ob.place(&bob).unwrap().is_empty());

        // Carol bids 9,300 USDC for 3 ETH (3,100/ETH) and crosses.
        let carol = offer(3, 4, USDC, 9_300, ETH, 3, 0);
        let fills = ob.place(&carol).unwrap();
        assert_eq!(fills.len(), 1);
        let f = &fills[0];
        assert_eq!(f.base_amount, amt(3));
        assert_eq!(f.quote_amount, amt(9_150));
        assert_eq!(f.maker, bob.owner);
        assert_eq!(f.taker, carol.owner);

        // Bob's resting ask decremented to 2 ETH; Carol fully consumed.
        assert_eq!(ob.resting_give(ETH, USDC, bob.owner, 2), Some(amt(2)));
        assert_eq!(ob.resting_give(USDC, ETH, carol.owner, 4), None);
    }

    #[test]
    fn non_crossing_offers_rest() {
        let mut ob = Orderbook::new(&[(ETH, USDC)]);
        let ask = offer(2, 2, ETH, 5, USDC, 15_250, 0);
        ob.place(&ask).unwrap();

        // 2,900/ETH bid does not reach the 3,050 ask.
        let bid = offer(3, 4, USDC, 8_700, ETH, 3, 0);
        assert!(ob.place(&bid).unwrap().is_empty());
        assert_eq!(ob.resting_give(USDC, ETH, bid.owner, 4), Some(amt(8_700)));
    }

    #[test]
    fn taker_aborts_below_min_fill() {
        let mut ob = Orderbook::new(&[(ETH, USDC)]);
        // Thin resting bid: 1 ETH worth of demand at 3,100.
        let bid = offer(3, 4, USDC, 3_100, ETH, 1, 0);
        ob.place(&bid).unwrap();

        // Bob wants at least half of his 5 ETH filled; only 1 is fillable.
        let bob = offer(2, 2, ETH, 5, USDC, 15_250, FILL_RATIO_HALF);
        let fills = ob.place(&bob).unwrap();
        assert!(fills.is_empty());
        // Both rest untouched.
        assert_eq!(ob.resting_give(USDC, ETH, bid.owner, 4), Some(amt(3_100)));
        assert_eq!(ob.resting_give(ETH, USDC, bob.owner, 2), Some(amt(5)));
    }

    #[test]
    fn price_time_priority_orders_fills() {
        let mut ob = Orderbook::new(&[(ETH, USDC)]);
        let cheap = offer(2, 2, ETH, 1, USDC, 3_000, 0);
        let pricey = offer(4, 2, ETH, 1, USDC, 3_200, 0);
        ob.place(&pricey).unwrap();
        ob.place(&cheap).unwrap();

        // A 2 ETH bid at 3,300 sweeps both, cheapest first.
        let bid = offer(3, 4, USDC, 6_600, ETH, 2, 0);
        let fills = ob.place(&bid).unwrap();
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].maker, cheap.owner);
        assert_eq!(fills[0].quote_amount, amt(3_000));
        assert_eq!(fills[1].maker, pricey.owner);
        assert_eq!(fills[1].quote_amount, amt(3_200));
    }

    #[test]
    fn cancel_removes_only_own_offer() {
        let mut ob = Orderbook::new(&[(ETH, USDC)]);
        let ask = offer(2, 2, ETH, 5, USDC, 15_250, 0);
        ob.place(&ask).unwrap();

        assert!(!ob.cancel(B256::from([9u8; 32]), ETH, USDC, 2));
        assert!(ob.cancel(ask.owner, ETH, USDC, 2));
        assert_eq!(ob.resting_give(ETH, USDC, ask.owner, 2), None);
    }
}
