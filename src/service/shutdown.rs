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

use tokio::sync::broadcast;

/// Listens for the server-wide shutdown broadcast.
///
/// The signal counts as received when the sender fires or when every sender is
/// dropped. Once received, further `recv` calls return immediately.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_on_signal_and_on_drop() {
        let (tx, _) = broadcast::channel(1);
        let mut signalled = Shutdown::new(tx.subscribe());

        tx.send(()).unwrap();
        let mut dropped = Shutdown::new(tx.subscribe());
        signalled.recv().await;
        assert!(signalled.is_shutdown());
        signalled.recv().await;

        drop(tx);
        dropped.recv().await;
        assert!(dropped.is_shutdown());
    }
}
