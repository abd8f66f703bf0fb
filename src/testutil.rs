//! Shared helpers for module tests.

use axum::Router;

use crate::types::{ActivityLevel, Direction, Listing, MarketSnapshot, Marketplace, MatchVariant, Signal, Venue};

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Direct clients that ignore proxy environment variables.
pub fn plain_clients(n: usize) -> Vec<(String, reqwest::Client)> {
    (0..n)
        .map(|i| {
            let client = reqwest::Client::builder().no_proxy().build().unwrap();
            (format!("local-{i}"), client)
        })
        .collect()
}

/// A cross-market signal with empty activity on both sides.
pub fn sample_signal(dedup_key: &str) -> Signal {
    let snapshot = |marketplace: Marketplace, price: f64| MarketSnapshot {
        marketplace,
        floor: Some(Listing {
            marketplace,
            collection_name: "Plush Pepe".to_string(),
            model_name: "Cozy Galaxy".to_string(),
            model_rarity_pct: 1.5,
            backdrop_name: "Onyx Black".to_string(),
            backdrop_rarity_pct: 2.0,
            price,
            external_id: "1".to_string(),
            raw_status: "listed".to_string(),
            gift_number: Some(7),
        }),
        second_floor: None,
        activity: Vec::new(),
        percentile_25: None,
        percentile_75: None,
        max_activity_price: None,
        last_sale: None,
        activity_level: ActivityLevel::Low,
        metadata: None,
        venue: match marketplace {
            Marketplace::Tonnel => Venue::Tonnel { site_url: "https://market.tonnel/".to_string() },
            Marketplace::Portals => Venue::Portals { attributes: Vec::new() },
        },
    };
    Signal {
        direction: Direction::TonnelToPortals,
        variant: MatchVariant::WithBackdrop,
        collection_name: "Plush Pepe".to_string(),
        model_name: "Cozy Galaxy".to_string(),
        backdrop_name: "Onyx Black".to_string(),
        dedup_key: dedup_key.to_string(),
        percent_diff: 20.0,
        percent_diff_with_fee: Some(19.7),
        buy_side: snapshot(Marketplace::Tonnel, 80.0),
        sell_side: snapshot(Marketplace::Portals, 100.0),
        detected_at_ns: 1_700_000_000_000_000_000,
    }
}
