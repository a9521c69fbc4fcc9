use log::debug;

use super::OrderPlugin;
use crate::model::{Order, Renewal, Target, TargetPart};

/// The whole target in one certificate.
pub struct Single;

impl OrderPlugin for Single {
    fn split(&self, renewal: &Renewal, target: Target) -> Vec<Order> {
        vec![Order::new(renewal, target, None)]
    }
}

/// One certificate per identifier.
pub struct Host;

impl OrderPlugin for Host {
    fn split(&self, renewal: &Renewal, target: Target) -> Vec<Order> {
        let mut orders: Vec<Order> = Vec::new();
        for part in &target.parts {
            for identifier in &part.identifiers {
                let identifier = identifier.to_lowercase();
                if orders
                    .iter()
                    .any(|order| order.cache_key_part.as_deref() == Some(identifier.as_str()))
                {
                    continue;
                }
                let mut single = Target::new(
                    identifier.clone(),
                    vec![TargetPart {
                        site_id: part.site_id,
                        identifiers: vec![identifier.clone()],
                    }],
                );
                single.friendly_name = target.friendly_name.clone();
                orders.push(Order::new(renewal, single, Some(identifier)));
            }
        }
        debug!("Split {} into {} host orders", renewal.id, orders.len());
        orders
    }
}

/// One certificate per target part, e.g. per web site.
pub struct Site;

impl OrderPlugin for Site {
    fn split(&self, renewal: &Renewal, target: Target) -> Vec<Order> {
        target
            .parts
            .iter()
            .enumerate()
            .filter(|(_, part)| !part.identifiers.is_empty())
            .map(|(index, part)| {
                let common_name = part
                    .identifiers
                    .iter()
                    .find(|id| id.eq_ignore_ascii_case(&target.common_name))
                    .or_else(|| part.identifiers.first())
                    .cloned()
                    .unwrap_or_default();
                let scope = match part.site_id {
                    Some(id) => format!("site{}", id),
                    None => format!("part{}", index),
                };
                let mut site = Target::new(common_name, vec![part.clone()]);
                site.friendly_name = target.friendly_name.clone();
                Order::new(renewal, site, Some(scope))
            })
            .collect()
    }
}
