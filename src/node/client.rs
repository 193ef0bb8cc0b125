//! Node data source abstraction and the lnd-manage REST implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::errors::{Error, Result};

use super::snapshot::{ChannelSnapshot, FeeUpdate};

/// Abstract capability the control loop needs from the node.
///
/// Transport and connection management are the implementation's concern;
/// the core treats both operations as black-box calls with a timeout and a
/// single error channel.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Ids of all currently open channels.
    async fn list_channel_ids(&self) -> Result<Vec<String>>;

    /// Snapshot of one channel. Failures map to
    /// [`Error::SnapshotUnavailable`] and skip the channel for the cycle.
    async fn channel_snapshot(&self, channel_id: &str) -> Result<ChannelSnapshot>;

    /// Apply a fee update to one channel. A refusal maps to
    /// [`Error::ApplyRejected`]; the caller records it with `success=false`
    /// and leaves its view of the fees unchanged.
    async fn apply_fees(&self, channel_id: &str, update: &FeeUpdate) -> Result<()>;
}

// Some lnd-manage fields arrive as JSON strings, msat amounts in
// particular.
fn u64_from_string_or_number<'de, D>(de: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    match Raw::deserialize(de)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn i64_from_string_or_number<'de, D>(de: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }
    match Raw::deserialize(de)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalPolicyDto {
    #[serde(default)]
    fee_rate_ppm: u32,
    #[serde(default, deserialize_with = "u64_from_string_or_number")]
    base_fee_milli_sat: u64,
    #[serde(default)]
    inbound_fee_rate_ppm: i32,
    #[serde(default, deserialize_with = "i64_from_string_or_number")]
    inbound_base_fee_milli_sat: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoliciesDto {
    #[serde(default)]
    local: LocalPolicyDto,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceDto {
    #[serde(default)]
    local_balance_sat: u64,
    #[serde(default)]
    remote_balance_sat: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlowReportDto {
    #[serde(default)]
    forwarded_received_milli_sat: u64,
    #[serde(default)]
    forwarded_sent_milli_sat: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeeReportDto {
    #[serde(default)]
    earned_milli_sat: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelDetailsDto {
    channel_id_compact: String,
    #[serde(default)]
    capacity_sat: u64,
    #[serde(default)]
    remote_pubkey: String,
    #[serde(default)]
    remote_alias: Option<String>,
    #[serde(default)]
    channel_age_days: Option<u32>,
    #[serde(default)]
    balance: BalanceDto,
    #[serde(default)]
    policies: PoliciesDto,
    #[serde(default)]
    flow_report: FlowReportDto,
    #[serde(default)]
    fee_report: FeeReportDto,
    #[serde(default)]
    peer_fee_rates_ppm: Vec<u32>,
    #[serde(default)]
    alternative_routes: u32,
}

impl ChannelDetailsDto {
    fn into_snapshot(self) -> ChannelSnapshot {
        ChannelSnapshot {
            channel_id: self.channel_id_compact,
            capacity_sat: self.capacity_sat,
            local_balance_sat: self.balance.local_balance_sat,
            remote_balance_sat: self.balance.remote_balance_sat,
            outbound_fee_ppm: self.policies.local.fee_rate_ppm,
            outbound_base_msat: self.policies.local.base_fee_milli_sat,
            inbound_fee_ppm: self.policies.local.inbound_fee_rate_ppm,
            inbound_base_msat: self.policies.local.inbound_base_fee_milli_sat,
            forwarded_in_7d_msat: self.flow_report.forwarded_received_milli_sat,
            forwarded_out_7d_msat: self.flow_report.forwarded_sent_milli_sat,
            fee_earned_msat: self.fee_report.earned_milli_sat,
            peer_pubkey: self.remote_pubkey,
            peer_alias: self.remote_alias,
            age_days: self.channel_age_days,
            peer_fee_rates: self.peer_fee_rates_ppm,
            alternative_routes: self.alternative_routes,
        }
    }
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct PolicyUpdateBody {
    fee_rate_ppm: u32,
    base_fee_milli_sat: u64,
    inbound_fee_rate_ppm: i32,
    inbound_base_fee_milli_sat: i64,
}

/// REST client for an lnd-manage style management API.
#[derive(Debug, Clone)]
pub struct LndManageClient {
    client: Client,
    base_url: String,
    timeout_secs: u64,
}

impl LndManageClient {
    /// Build a client with a per-request timeout. All calls fail rather
    /// than block past the deadline.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_secs: timeout.as_secs(),
        })
    }

    fn map_transport(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout {
                timeout_secs: self.timeout_secs,
            }
        } else {
            Error::Request(e.to_string())
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Http {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::JsonParse(e.to_string()))
    }
}

#[async_trait]
impl NodeClient for LndManageClient {
    async fn list_channel_ids(&self) -> Result<Vec<String>> {
        self.get_json("/api/status/open-channels").await
    }

    async fn channel_snapshot(&self, channel_id: &str) -> Result<ChannelSnapshot> {
        let path = format!("/api/channel/{channel_id}/details");
        let dto: ChannelDetailsDto = self
            .get_json(&path)
            .await
            .map_err(|e| Error::snapshot_unavailable(channel_id, e.to_string()))?;
        Ok(dto.into_snapshot())
    }

    async fn apply_fees(&self, channel_id: &str, update: &FeeUpdate) -> Result<()> {
        let url = format!("{}/api/channel/{channel_id}/policy", self.base_url);
        let body = PolicyUpdateBody {
            fee_rate_ppm: update.outbound_fee_ppm,
            base_fee_milli_sat: update.outbound_base_msat,
            inbound_fee_rate_ppm: update.inbound_fee_ppm,
            inbound_base_fee_milli_sat: update.inbound_base_msat,
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::apply_rejected(channel_id, self.map_transport(e).to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::apply_rejected(
                channel_id,
                format!("status {status}: {message}"),
            ));
        }
        debug!(
            channel = %channel_id,
            outbound_ppm = update.outbound_fee_ppm,
            inbound_ppm = update.inbound_fee_ppm,
            "fee update accepted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_details_parsing_with_string_msat() {
        let json = r#"{
            "channelIdCompact": "871x2x1",
            "capacitySat": 5000000,
            "remotePubkey": "02abc",
            "remoteAlias": "carol",
            "balance": {"localBalanceSat": 4000000, "remoteBalanceSat": 1000000},
            "policies": {"local": {
                "feeRatePpm": 120,
                "baseFeeMilliSat": "1000",
                "inboundFeeRatePpm": -25,
                "inboundBaseFeeMilliSat": "0"
            }},
            "flowReport": {"forwardedReceivedMilliSat": 7, "forwardedSentMilliSat": 9},
            "feeReport": {"earnedMilliSat": 42}
        }"#;
        let dto: ChannelDetailsDto = serde_json::from_str(json).unwrap();
        let snap = dto.into_snapshot();
        assert_eq!(snap.channel_id, "871x2x1");
        assert_eq!(snap.outbound_base_msat, 1000);
        assert_eq!(snap.inbound_fee_ppm, -25);
        assert_eq!(snap.forwarded_in_7d_msat, 7);
        assert_eq!(snap.fee_earned_msat, 42);
        assert_eq!(snap.peer_alias.as_deref(), Some("carol"));
    }

    #[test]
    fn test_missing_sections_default() {
        let json = r#"{"channelIdCompact": "1x1x1"}"#;
        let dto: ChannelDetailsDto = serde_json::from_str(json).unwrap();
        let snap = dto.into_snapshot();
        assert_eq!(snap.capacity_sat, 0);
        assert_eq!(snap.outbound_fee_ppm, 0);
        assert!(snap.peer_fee_rates.is_empty());
    }

    #[test]
    fn test_trailing_slash_stripped() {
        let client =
            LndManageClient::new("http://localhost:18081/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url, "http://localhost:18081");
    }
}
