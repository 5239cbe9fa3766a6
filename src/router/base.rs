// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use async_trait::async_trait;

use crate::router::Request;

/// A fixed three-phase route: `pre_handle`, `handle`, `post_handle`.
///
/// Every phase defaults to a no-op. A phase may call [`Request::abort`] to skip
/// the rest or [`Request::goto`] to move the cursor.
#[async_trait]
pub trait Router: Send + Sync {
    async fn pre_handle(&self, _request: &mut Request) {}

    async fn handle(&self, _request: &mut Request) {}

    async fn post_handle(&self, _request: &mut Request) {}
}
