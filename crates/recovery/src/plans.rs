//! Plan catalog
//!
//! Closed static mapping from plan id to limits. Unknown or empty plan ids
//! resolve to FREE, so a merchant row can never escape quota enforcement by
//! carrying a stale price id.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub id: &'static str,
    pub name: &'static str,
    /// Dunning emails allowed per calendar month.
    pub monthly_limit: i64,
    /// Pending tasks allowed in the queue at once.
    pub queue_limit: i64,
}

pub const FREE: Plan = Plan {
    id: "price_free",
    name: "Free",
    monthly_limit: 20,
    queue_limit: 10,
};

pub const GROWTH: Plan = Plan {
    id: "price_growth",
    name: "Growth",
    monthly_limit: 500,
    queue_limit: 100,
};

pub const SCALE: Plan = Plan {
    id: "price_scale",
    name: "Scale",
    monthly_limit: 5_000,
    queue_limit: 1_000,
};

const ALL: [&Plan; 3] = [&FREE, &GROWTH, &SCALE];

/// Resolve a merchant's plan id; unknown ids fall back to FREE.
pub fn plan_for(plan_id: &str) -> &'static Plan {
    ALL.iter()
        .find(|p| p.id == plan_id)
        .copied()
        .unwrap_or(&FREE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ids_resolve() {
        assert_eq!(plan_for("price_growth").name, "Growth");
        assert_eq!(plan_for("price_scale").monthly_limit, 5_000);
    }

    #[test]
    fn unknown_ids_fall_back_to_free() {
        assert_eq!(plan_for("price_enterprise_custom").id, FREE.id);
        assert_eq!(plan_for("").id, FREE.id);
    }

    #[test]
    fn limits_are_ordered_by_tier() {
        assert!(FREE.monthly_limit < GROWTH.monthly_limit);
        assert!(GROWTH.monthly_limit < SCALE.monthly_limit);
        assert!(FREE.queue_limit < GROWTH.queue_limit);
    }
}
