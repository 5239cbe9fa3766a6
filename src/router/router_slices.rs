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

use crate::router::RouterHandler;

/// Routes made of arbitrary handler lists with shared middleware.
///
/// A route's chain is fixed at registration time: the chain-level handlers
/// installed so far, then the group's, then the route's own.
#[derive(Default)]
pub struct RouterSlices {
    apis: HashMap<u32, Arc<[RouterHandler]>>,
    handlers: Vec<RouterHandler>,
}

impl RouterSlices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds shared handlers ahead of every route registered afterwards.
    pub fn use_handlers(&mut self, handlers: impl IntoIterator<Item = RouterHandler>) {
        self.handlers.extend(handlers);
    }

    /// # Panics
    ///
    /// Panics if `msg_id` is already registered.
    pub fn add_handler(&mut self, msg_id: u32, handlers: impl IntoIterator<Item = RouterHandler>) {
        if self.apis.contains_key(&msg_id) {
            panic!("repeated api, msg_id = {msg_id}");
        }
        let merged: Vec<RouterHandler> = self
            .handlers
            .iter()
            .cloned()
            .chain(handlers)
            .collect();
        self.apis.insert(msg_id, Arc::from(merged));
    }

    /// Opens a group for message ids in `start..=end`.
    pub fn group(
        &mut self,
        start: u32,
        end: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> GroupRouter<'_> {
        GroupRouter {
            start,
            end,
            handlers: handlers.into_iter().collect(),
            router: self,
        }
    }

    pub fn get_handlers(&self, msg_id: u32) -> Option<Arc<[RouterHandler]>> {
        self.apis.get(&msg_id).cloned()
    }

    pub fn contains(&self, msg_id: u32) -> bool {
        self.apis.contains_key(&msg_id)
    }
}

/// A contiguous message-id range sharing extra middleware.
pub struct GroupRouter<'a> {
    start: u32,
    end: u32,
    handlers: Vec<RouterHandler>,
    router: &'a mut RouterSlices,
}

impl GroupRouter<'_> {
    /// Group-level middleware, additive to the chain-level handlers.
    pub fn use_handlers(&mut self, handlers: impl IntoIterator<Item = RouterHandler>) -> &mut Self {
        self.handlers.extend(handlers);
        self
    }

    /// # Panics
    ///
    /// Panics if `msg_id` is outside the group's range or already registered.
    pub fn add_handler(
        &mut self,
        msg_id: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> &mut Self {
        if msg_id < self.start || msg_id > self.end {
            panic!(
                "add router to group err in msg_id: {msg_id}, group range [{}, {}]",
                self.start, self.end
            );
        }
        let merged: Vec<RouterHandler> = self.handlers.iter().cloned().chain(handlers).collect();
        self.router.add_handler(msg_id, merged);
        self
    }
}
