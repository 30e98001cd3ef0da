// SPDX-License-Identifier: LGPL-2.1-or-later

//! Raw uAPI bindings. Nothing in this module performs validation or holds
//! state; it exists purely to give the rest of the crate typed, `repr(C)`
//! access to the kernel interfaces named by the uAPI.

pub mod cdev;
pub mod hwdep;
