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

use std::fmt;

type Callback = Box<dyn FnOnce() + Send>;

struct Entry {
    handler: String,
    key: String,
    callback: Callback,
}

/// Ordered callbacks run once when a connection is torn down.
///
/// Each callback is registered under a `(handler, key)` pair so that the
/// component that installed it can remove it again.
#[derive(Default)]
pub struct CloseCallbacks {
    entries: Vec<Entry>,
}

impl CloseCallbacks {
    pub fn add<F>(&mut self, handler: &str, key: &str, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.entries.push(Entry {
            handler: handler.to_string(),
            key: key.to_string(),
            callback: Box::new(callback),
        });
    }

    /// Removes every callback registered under `(handler, key)`.
    pub fn remove(&mut self, handler: &str, key: &str) {
        self.entries
            .retain(|entry| entry.handler != handler || entry.key != key);
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Runs the callbacks in registration order, consuming them.
    pub fn invoke(self) {
        for entry in self.entries {
            (entry.callback)();
        }
    }
}

impl fmt::Debug for CloseCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (&e.handler, &e.key)))
            .finish()
    }
}
