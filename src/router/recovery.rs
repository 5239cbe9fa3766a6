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

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::error;

use crate::router::{handler, RouterHandler};
use crate::utils::panic_message;

/// Middleware that catches a panic anywhere downstream, logs it with the
/// message id and aborts the request instead of unwinding into the worker.
pub fn recovery() -> RouterHandler {
    handler(|request| {
        async move {
            let conn_id = request.conn_id();
            let msg_id = request.msg_id();
            let outcome = AssertUnwindSafe(request.next()).catch_unwind().await;
            if let Err(payload) = outcome {
                error!(
                    conn_id,
                    msg_id,
                    "handler panicked: {}",
                    panic_message(payload.as_ref())
                );
                request.abort();
            }
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Message;
    use crate::router::{Request, RouterSlices};
    use crate::service::{ConnSetup, ServerConfig};
    use crate::testing::{context, duplex_connection};

    #[tokio::test]
    async fn panic_downstream_aborts_request() {
        let mut slices = RouterSlices::new();
        slices.use_handlers([recovery()]);
        slices.add_handler(
            1,
            [handler(|_request| async move { panic!("boom") }.boxed())],
        );

        let env = context(ConnSetup::new(), ServerConfig::default());
        let (conn, _peer) = duplex_connection(1, &env.ctx);
        let mut request = Request::new(conn, Message::new(1, "x"));
        request.call_handlers(slices.get_handlers(1).unwrap()).await;

        assert!(request.is_aborted());
    }
}
