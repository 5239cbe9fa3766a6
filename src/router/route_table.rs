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

use std::collections::HashMap;
use std::sync::Arc;

use crate::router::{GroupRouter, Router, RouterHandler, RouterSlices};

/// What a message id resolves to.
#[derive(Clone)]
pub enum Route {
    Fixed(Arc<dyn Router>),
    Slices(Arc<[RouterHandler]>),
}

/// Maps message ids to routes. Both router flavours can be mixed, but one id
/// belongs to exactly one route; registering it twice panics.
#[derive(Default)]
pub struct RouterTable {
    apis: HashMap<u32, Arc<dyn Router>>,
    slices: RouterSlices,
}

impl RouterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    ///
    /// Panics if `msg_id` is already registered.
    pub fn add_router(&mut self, msg_id: u32, router: Arc<dyn Router>) {
        if self.apis.contains_key(&msg_id) || self.slices.contains(msg_id) {
            panic!("repeated api, msg_id = {msg_id}");
        }
        self.apis.insert(msg_id, router);
    }

    pub fn use_handlers(&mut self, handlers: impl IntoIterator<Item = RouterHandler>) {
        self.slices.use_handlers(handlers);
    }

    /// # Panics
    ///
    /// Panics if `msg_id` is already registered.
    pub fn add_handler(&mut self, msg_id: u32, handlers: impl IntoIterator<Item = RouterHandler>) {
        if self.apis.contains_key(&msg_id) {
            panic!("repeated api, msg_id = {msg_id}");
        }
        self.slices.add_handler(msg_id, handlers);
    }

    pub fn group(
        &mut self,
        start: u32,
        end: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> GroupRouter<'_> {
        self.slices.group(start, end, handlers)
    }

    /// # Panics
    ///
    /// Panics if a group registered an id that also has a fixed router.
    pub fn validate(&self) {
        if let Some(msg_id) = self.apis.keys().find(|id| self.slices.contains(**id)) {
            panic!("repeated api, msg_id = {msg_id}");
        }
    }

    pub fn resolve(&self, msg_id: u32) -> Option<Route> {
        if let Some(router) = self.apis.get(&msg_id) {
            return Some(Route::Fixed(router.clone()));
        }
        self.slices.get_handlers(msg_id).map(Route::Slices)
    }
}
