use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::activity_thresholds;

// ---------------------------------------------------------------------------
// Marketplace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Marketplace {
    /// Browser-only marketplace behind an anti-bot challenge.
    Tonnel,
    /// Plain JSON API reachable through proxied HTTP clients.
    Portals,
}

impl std::fmt::Display for Marketplace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Marketplace::Tonnel => "tonnel",
            Marketplace::Portals => "portals",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Listings and activity
// ---------------------------------------------------------------------------

/// One active listing as normalized from a marketplace response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub marketplace: Marketplace,
    pub collection_name: String,
    pub model_name: String,
    pub model_rarity_pct: f64,
    pub backdrop_name: String,
    pub backdrop_rarity_pct: f64,
    pub price: f64,
    pub external_id: String,
    pub raw_status: String,
    /// Collection serial number, used to build the public gift page URL.
    pub gift_number: Option<u64>,
}

/// A completed sale inside the lookback window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub price: f64,
    /// Unix seconds.
    pub timestamp: f64,
    pub kind: String,
}

/// Queue item produced by the scanner and consumed by exactly one evaluator worker.
#[derive(Debug, Clone, PartialEq)]
pub struct GiftCandidate {
    pub marketplace: Marketplace,
    pub collection_name: String,
    pub model_name: String,
    pub model_pct: f64,
    pub backdrop_name: String,
    pub backdrop_pct: f64,
    pub price: f64,
    pub gift_number: Option<u64>,
    pub dedup_key: String,
}

impl GiftCandidate {
    pub fn from_listing(listing: &Listing) -> Self {
        Self {
            marketplace: listing.marketplace,
            collection_name: listing.collection_name.clone(),
            model_name: listing.model_name.clone(),
            model_pct: listing.model_rarity_pct,
            backdrop_name: listing.backdrop_name.clone(),
            backdrop_pct: listing.backdrop_rarity_pct,
            price: listing.price,
            gift_number: listing.gift_number,
            dedup_key: dedup_key(listing.marketplace, &listing.external_id, listing.price),
        }
    }
}

/// Identifier + price: a relisting at a new price is a new candidate.
pub fn dedup_key(marketplace: Marketplace, external_id: &str, price: f64) -> String {
    format!("{marketplace}:{external_id}:{price}")
}

// ---------------------------------------------------------------------------
// Activity level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    Low,
    Medium,
    High,
}

impl ActivityLevel {
    pub fn from_sale_count(count: usize) -> Self {
        use activity_thresholds::*;
        if count >= HIGH_MIN {
            ActivityLevel::High
        } else if count >= MEDIUM_MIN {
            ActivityLevel::Medium
        } else {
            ActivityLevel::Low
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(ActivityLevel::Low),
            "medium" => Some(ActivityLevel::Medium),
            "high" => Some(ActivityLevel::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityLevel::Low => "low",
            ActivityLevel::Medium => "medium",
            ActivityLevel::High => "high",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Direction / variant
// ---------------------------------------------------------------------------

/// The four comparisons, declared in tie-break priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Tonnel floor vs Tonnel second floor.
    TonnelFloor,
    /// Buy the Tonnel floor, reference the Portals floor.
    TonnelToPortals,
    /// Portals floor vs Portals second floor.
    PortalsFloor,
    /// Buy the Portals floor, reference the Tonnel floor.
    PortalsToTonnel,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::TonnelFloor,
        Direction::TonnelToPortals,
        Direction::PortalsFloor,
        Direction::PortalsToTonnel,
    ];

    /// Marketplace the floor listing is bought on.
    pub fn buy_market(self) -> Marketplace {
        match self {
            Direction::TonnelFloor | Direction::TonnelToPortals => Marketplace::Tonnel,
            Direction::PortalsFloor | Direction::PortalsToTonnel => Marketplace::Portals,
        }
    }

    /// Marketplace whose price is the reference.
    pub fn reference_market(self) -> Marketplace {
        match self {
            Direction::TonnelFloor | Direction::PortalsToTonnel => Marketplace::Tonnel,
            Direction::PortalsFloor | Direction::TonnelToPortals => Marketplace::Portals,
        }
    }

    pub fn is_cross_market(self) -> bool {
        self.buy_market() != self.reference_market()
    }

    pub fn parse(s: &str) -> Option<Self> {
        Direction::ALL.into_iter().find(|d| d.to_string() == s.to_ascii_lowercase())
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Direction::TonnelFloor => "tonnel_floor",
            Direction::TonnelToPortals => "tonnel_to_portals",
            Direction::PortalsFloor => "portals_floor",
            Direction::PortalsToTonnel => "portals_to_tonnel",
        };
        write!(f, "{s}")
    }
}

/// Whether comparable listings must also share the backdrop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchVariant {
    WithBackdrop,
    ModelOnly,
}

impl std::fmt::Display for MatchVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchVariant::WithBackdrop => write!(f, "with_backdrop"),
            MatchVariant::ModelOnly => write!(f, "model_only"),
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RarityAttr {
    pub name: String,
    pub rarity_pct: f64,
}

/// Public descriptive data for one gift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiftMetadata {
    pub model: RarityAttr,
    pub backdrop: RarityAttr,
    pub symbol: RarityAttr,
    pub issued: u64,
    pub total: u64,
    pub previously_sold: bool,
}

// ---------------------------------------------------------------------------
// Snapshots and signals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastSale {
    pub price: f64,
    pub timestamp: f64,
}

/// Portals exposes typed attributes per listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub kind: String,
    pub value: String,
    pub rarity_pct: Option<f64>,
}

/// Marketplace-specific part of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "venue", rename_all = "lowercase")]
pub enum Venue {
    Tonnel { site_url: String },
    Portals { attributes: Vec<Attribute> },
}

/// Per-marketplace view built by one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub marketplace: Marketplace,
    pub floor: Option<Listing>,
    pub second_floor: Option<Listing>,
    pub activity: Vec<ActivityRecord>,
    pub percentile_25: Option<f64>,
    pub percentile_75: Option<f64>,
    pub max_activity_price: Option<f64>,
    pub last_sale: Option<LastSale>,
    pub activity_level: ActivityLevel,
    pub metadata: Option<GiftMetadata>,
    pub venue: Venue,
}

impl MarketSnapshot {
    pub fn floor_price(&self) -> Option<f64> {
        self.floor.as_ref().map(|l| l.price)
    }

    pub fn second_floor_price(&self) -> Option<f64> {
        self.second_floor.as_ref().map(|l| l.price)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub direction: Direction,
    pub variant: MatchVariant,
    pub collection_name: String,
    pub model_name: String,
    pub backdrop_name: String,
    pub dedup_key: String,
    pub percent_diff: f64,
    /// Present for cross-market directions only.
    pub percent_diff_with_fee: Option<f64>,
    pub buy_side: MarketSnapshot,
    pub sell_side: MarketSnapshot,
    /// Nanosecond UTC epoch.
    pub detected_at_ns: u64,
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Allowed directions and activity levels. Empty sets allow everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalFilter {
    pub directions: HashSet<Direction>,
    pub activity: HashSet<ActivityLevel>,
}

impl SignalFilter {
    pub fn allows(&self, direction: Direction, activity: ActivityLevel) -> bool {
        (self.directions.is_empty() || self.directions.contains(&direction))
            && (self.activity.is_empty() || self.activity.contains(&activity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_level_boundaries() {
        assert_eq!(ActivityLevel::from_sale_count(0), ActivityLevel::Low);
        assert_eq!(ActivityLevel::from_sale_count(4), ActivityLevel::Low);
        assert_eq!(ActivityLevel::from_sale_count(5), ActivityLevel::Medium);
        assert_eq!(ActivityLevel::from_sale_count(9), ActivityLevel::Medium);
        assert_eq!(ActivityLevel::from_sale_count(10), ActivityLevel::High);
    }

    #[test]
    fn direction_markets() {
        assert_eq!(Direction::TonnelToPortals.buy_market(), Marketplace::Tonnel);
        assert_eq!(Direction::TonnelToPortals.reference_market(), Marketplace::Portals);
        assert!(Direction::PortalsToTonnel.is_cross_market());
        assert!(!Direction::PortalsFloor.is_cross_market());
        assert_eq!(Direction::parse("PORTALS_FLOOR"), Some(Direction::PortalsFloor));
    }

    #[test]
    fn empty_filter_allows_everything() {
        let filter = SignalFilter::default();
        assert!(filter.allows(Direction::TonnelFloor, ActivityLevel::Low));

        let filter = SignalFilter {
            directions: [Direction::TonnelToPortals].into_iter().collect(),
            activity: [ActivityLevel::High, ActivityLevel::Medium].into_iter().collect(),
        };
        assert!(filter.allows(Direction::TonnelToPortals, ActivityLevel::High));
        assert!(!filter.allows(Direction::TonnelFloor, ActivityLevel::High));
        assert!(!filter.allows(Direction::TonnelToPortals, ActivityLevel::Low));
    }

    #[test]
    fn dedup_key_includes_price() {
        assert_eq!(dedup_key(Marketplace::Tonnel, "42", 12.5), "tonnel:42:12.5");
        assert_ne!(
            dedup_key(Marketplace::Tonnel, "42", 12.5),
            dedup_key(Marketplace::Tonnel, "42", 13.0)
        );
    }
}
