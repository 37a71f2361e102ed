//! Shared console icons, with plain-text fallbacks for terminals without emoji.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "");
pub static STOP: Emoji<'_, '_> = Emoji("🛑 ", "");
pub static BROOM: Emoji<'_, '_> = Emoji("🧹 ", "");
pub static PACKAGE: Emoji<'_, '_> = Emoji("📦 ", "");
