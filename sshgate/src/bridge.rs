// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;

use crate::channel::Environment;
use crate::console::Console;
use crate::endpoint::Endpoint;
use crate::splice::{Splice, SpliceConfig};
use crate::{CloseReason, Error};

/// Start the hosted console with `env` and join it to `channel`.
///
/// Fails with `BackendUnavailable` if the console cannot be started.
/// `channel` is dropped in that case.
pub(crate) fn attach(
    console: &dyn Console,
    env: &Environment,
    channel: Endpoint,
    config: SpliceConfig,
) -> Result<Splice, Error> {
    let backend = console.start(env).map_err(Error::BackendUnavailable)?;
    Ok(Splice::new(channel, backend).with_config(config))
}

/// Drive an attached splice until it ends or is cancelled.
pub(crate) async fn run<F>(splice: Splice, cancel: F) -> CloseReason
where
    F: Future<Output = CloseReason>,
{
    splice.run_until(cancel).await.reason
}
