// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

/// What the kernel announces to listeners.
///
/// `Update` fires at snapshot and at rollback, `Publish` only on a
/// successful broadcast, `Load` when a creation is fully materialized.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
    Load,
    Update,
    Publish,
}

#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub location: String,
}
