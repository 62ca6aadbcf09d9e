// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types describing the provider's control-plane API boundary

mod error;

pub use error::ApiError;
pub use error::ResourceType;
