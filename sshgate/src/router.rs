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

use crate::channel::{ChannelKind, Target};
use crate::Error;

/// What a newly opened channel gets wired to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Wait for `exec` or `shell`, then splice to the hosted console.
    ExecBridge,
    /// Dial the target now and splice to the socket.
    Connector(Target),
}

/// Decide how a channel of the given kind is served.
pub fn route(kind: &ChannelKind) -> Result<Binding, Error> {
    match kind {
        ChannelKind::Session => Ok(Binding::ExecBridge),
        ChannelKind::DirectTcpip(target) => {
            if target.port == 0 || target.port > u32::from(u16::MAX) {
                return Err(Error::ConnectFailed(format!(
                    "invalid port {} for {}",
                    target.port, target.host
                )));
            }
            Ok(Binding::Connector(target.clone()))
        }
        ChannelKind::ForwardedTcpip => Err(Error::UnsupportedChannelType),
    }
}
