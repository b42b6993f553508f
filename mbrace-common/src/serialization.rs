// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Every persisted or wire-transferred value is prefixed with a format
/// version byte. Nodes running the same code version round-trip; anything
/// else is rejected instead of misinterpreted.
pub const SERIALIZATION_VERSION_V1: u8 = 1u8;

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, String> {
    let mut result = vec![SERIALIZATION_VERSION_V1];
    let encoded = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|err| format!("Failed to serialize value: {err}"))?;
    result.extend(encoded);
    Ok(result)
}

pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
    match bytes.first() {
        Some(&SERIALIZATION_VERSION_V1) => {
            let (value, _) =
                bincode::serde::decode_from_slice(&bytes[1..], bincode::config::standard())
                    .map_err(|err| format!("Failed to deserialize value: {err}"))?;
            Ok(value)
        }
        Some(version) => Err(format!("Unsupported serialization version: {version}")),
        None => Err("Cannot deserialize empty byte array".to_string()),
    }
}
