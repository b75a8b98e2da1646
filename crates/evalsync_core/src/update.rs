use chrono::{DateTime, Utc};

use crate::{Effect, Msg, Store};

/// Pure update function: applies a message to the store at `now` and returns
/// the effects the runtime must execute.
pub fn update(mut store: Store, msg: Msg, now: DateTime<Utc>) -> (Store, Vec<Effect>) {
    let effects = store.handle(msg, now);
    (store, effects)
}
