// SPDX-License-Identifier: MPL-2.0

pub(crate) use std::{
    any::Any,
    collections::{BTreeMap, VecDeque},
    fmt::Debug,
    ops::Range,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    vec,
    vec::Vec,
};
