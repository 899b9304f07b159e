//! Per-field value checks shared by local edits and remote merges.
//!
//! Each check looks only at the incoming value, never at the record it lands
//! in, so every peer reaches the same verdict for the same update.

use renga_types::{ConsequenceTransaction, RollOutcome, TraitOp, TraitTransaction};

use crate::error::{TurnError, TurnResult};

/// Longest accepted action / trait name.
pub const MAX_NAME_LEN: usize = 64;
/// Most segments a single consequence may tick.
pub const MAX_SEGMENTS: u32 = 12;
/// Most dice in one roll.
pub const MAX_DICE: usize = 8;

fn check_name(field: &'static str, name: &str) -> TurnResult<()> {
    if name.trim().is_empty() {
        return Err(TurnError::invalid(field, "empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(TurnError::invalid(
            field,
            format!("longer than {MAX_NAME_LEN} characters"),
        ));
    }
    Ok(())
}

pub fn action(value: Option<&str>) -> TurnResult<()> {
    match value {
        Some(name) => check_name("action", name),
        None => Ok(()),
    }
}

pub fn equipped(items: &[String]) -> TurnResult<()> {
    for (i, item) in items.iter().enumerate() {
        if item.trim().is_empty() {
            return Err(TurnError::invalid("equipped", format!("item {i} is empty")));
        }
        if items[..i].contains(item) {
            return Err(TurnError::invalid("equipped", format!("{item} listed twice")));
        }
    }
    Ok(())
}

pub fn trait_tx(tx: Option<&TraitTransaction>) -> TurnResult<()> {
    match tx.map(|tx| &tx.op) {
        Some(TraitOp::Create { name }) => check_name("traitTx", name),
        Some(TraitOp::Reuse { trait_id }) if trait_id.trim().is_empty() => {
            Err(TurnError::invalid("traitTx", "empty trait id"))
        }
        _ => Ok(()),
    }
}

pub fn consequence_tx(tx: Option<&ConsequenceTransaction>) -> TurnResult<()> {
    let Some(tx) = tx else {
        return Ok(());
    };
    if tx.segments > MAX_SEGMENTS {
        return Err(TurnError::invalid(
            "consequenceTx",
            format!("{} segments exceeds {MAX_SEGMENTS}", tx.segments),
        ));
    }
    if tx.target.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(TurnError::invalid("consequenceTx", "blank target"));
    }
    Ok(())
}

pub fn last_roll(roll: Option<&RollOutcome>) -> TurnResult<()> {
    let Some(roll) = roll else {
        return Ok(());
    };
    if roll.dice.len() > MAX_DICE {
        return Err(TurnError::invalid("lastRoll", "too many dice"));
    }
    if let Some(bad) = roll.dice.iter().find(|d| !(1..=6).contains(*d)) {
        return Err(TurnError::invalid("lastRoll", format!("die face {bad}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use renga_types::{ActorId, RollResult};

    #[test]
    fn test_action_rules() {
        assert!(action(None).is_ok());
        assert!(action(Some("prowl")).is_ok());
        assert!(action(Some("  ")).is_err());
        assert!(action(Some(&"x".repeat(MAX_NAME_LEN + 1))).is_err());
    }

    #[test]
    fn test_equipped_rejects_duplicates() {
        let items = vec!["lantern".to_string(), "rope".to_string(), "lantern".to_string()];
        let err = equipped(&items).expect_err("duplicate");
        assert!(matches!(err, TurnError::InvalidField { field: "equipped", .. }));
    }

    #[test]
    fn test_trait_and_consequence_rules() {
        let bad = TraitTransaction {
            target_actor: ActorId::new(),
            op: TraitOp::Create { name: String::new() },
        };
        assert!(trait_tx(Some(&bad)).is_err());

        let too_big = ConsequenceTransaction {
            target: Some("heat".into()),
            segments: MAX_SEGMENTS + 1,
            note: None,
        };
        assert!(consequence_tx(Some(&too_big)).is_err());
        // No target yet is fine while staging
        assert!(consequence_tx(Some(&ConsequenceTransaction::default())).is_ok());
    }

    #[test]
    fn test_roll_faces() {
        let roll = RollOutcome {
            dice: vec![3, 7],
            result: RollResult::Failure,
        };
        assert!(last_roll(Some(&roll)).is_err());
        assert!(last_roll(Some(&RollOutcome::from_dice(&[1, 6], false))).is_ok());
    }
}
