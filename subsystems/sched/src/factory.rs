//! # Constraint Factory
//!
//! Maps the type tag in word 2 of a creation message to the parser of the
//! matching constraint variant. The table is built once, before the first
//! CPU schedules, and is read-only afterwards.

use crate::config::SchedConfig;
use crate::constraint::{self, word, ConstraintParams, ConstraintType};
use crate::invoke::Mword;
use crate::SchedResult;
use spin::Once;

/// Parser of one constraint variant's creation message
pub type ParseFn = fn(&[Mword], &SchedConfig) -> SchedResult<ConstraintParams>;

/// Word holding the type tag
pub const TAG_WORD: usize = 2;

struct FactoryEntry {
    ty: ConstraintType,
    parse: ParseFn,
}

static FACTORIES: Once<[FactoryEntry; 5]> = Once::new();

fn factories() -> &'static [FactoryEntry; 5] {
    FACTORIES.call_once(|| {
        let table = [
            FactoryEntry { ty: ConstraintType::Gate, parse: constraint::gate::parse },
            FactoryEntry { ty: ConstraintType::Quantum, parse: constraint::quantum::parse },
            FactoryEntry { ty: ConstraintType::Budget, parse: constraint::budget::parse },
            FactoryEntry { ty: ConstraintType::TimeWindow, parse: constraint::window::parse },
            FactoryEntry { ty: ConstraintType::Bandwidth, parse: constraint::bandwidth::parse },
        ];
        log::debug!("[factory] {} constraint types registered", table.len());
        table
    })
}

/// Build the factory table
pub fn init() {
    factories();
}

/// Constraint types the factory can build
pub fn supported() -> impl Iterator<Item = ConstraintType> {
    factories().iter().map(|entry| entry.ty)
}

/// Decode and validate a creation message `[label, _, tag, params...]`
pub fn parse(words: &[Mword], config: &SchedConfig) -> SchedResult<ConstraintParams> {
    let tag = word(words, TAG_WORD)?;
    let ty = ConstraintType::try_from(tag).map_err(|err| {
        log::warn!("[factory] unknown constraint type {}", tag);
        err
    })?;
    let entry = &factories()[usize::from(ty.tag())];
    debug_assert_eq!(entry.ty, ty);

    let params = (entry.parse)(words, config)?;
    params.validate()?;
    Ok(params)
}
