//! Resolves the VPC, subnet and availability zone.

use super::{ec2, try_step, Step};
use crate::cancellation::CancellationToken;
use crate::cloud::{Filter, Subnet};
use crate::config::{to_filters, SubnetFilter};
use crate::context::keys::{AVAILABILITY_ZONE, SUBNET_ID, VPC_ID};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use async_trait::async_trait;
use tracing::info;

/// Publishes `vpc_id`, `subnet_id` and `availability_zone`.
///
/// An explicit subnet wins over `subnet_filter`. With `most_free` set, the
/// subnet with the most free addresses is picked among several matches.
#[derive(Debug, Clone, Default)]
pub struct NetworkInfo {
    /// Explicit VPC.
    pub vpc_id: String,
    /// Explicit subnet.
    pub subnet_id: String,
    /// Subnet lookup by filters.
    pub subnet_filter: SubnetFilter,
    /// Explicit availability zone.
    pub availability_zone: String,
}

fn pick_subnet(mut subnets: Vec<Subnet>, most_free: bool) -> Result<Subnet, AmiforgeError> {
    match subnets.len() {
        0 => Err(AmiforgeError::step("no subnets found matching subnet_filter")),
        1 => Ok(subnets.remove(0)),
        n if !most_free => Err(AmiforgeError::step(format!(
            "your filter matched {n} subnets; please try a more specific search, or set most_free to true"
        ))),
        _ => {
            subnets.sort_by_key(|s| s.available_ip_count);
            subnets
                .pop()
                .ok_or_else(|| AmiforgeError::step("no subnets found matching subnet_filter"))
        }
    }
}

#[async_trait]
impl Step for NetworkInfo {
    fn name(&self) -> &str {
        "network_info"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &StateBag) -> StepAction {
        let mut vpc_id = self.vpc_id.clone();
        let mut subnet_id = self.subnet_id.clone();
        let mut zone = self.availability_zone.clone();

        if subnet_id.is_empty() && !self.subnet_filter.filters.is_empty() {
            let ec2 = try_step!(state, ec2(state));
            let mut filters = to_filters(&self.subnet_filter.filters);
            if !vpc_id.is_empty() {
                filters.push(Filter::new("vpc-id", vpc_id.clone()));
            }
            if !zone.is_empty() {
                filters.push(Filter::new("availability-zone", zone.clone()));
            }
            let subnets = try_step!(state, ec2.describe_subnets(&filters).await);
            let subnet = try_step!(state, pick_subnet(subnets, self.subnet_filter.most_free));
            info!(subnet_id = %subnet.id, "Found subnet");
            subnet_id = subnet.id;
            vpc_id = subnet.vpc_id;
            zone = subnet.availability_zone;
        } else if !subnet_id.is_empty() && (vpc_id.is_empty() || zone.is_empty()) {
            let ec2 = try_step!(state, ec2(state));
            let filters = [Filter::new("subnet-id", subnet_id.clone())];
            let subnets = try_step!(state, ec2.describe_subnets(&filters).await);
            let subnet = try_step!(state, pick_subnet(subnets, false));
            if vpc_id.is_empty() {
                vpc_id = subnet.vpc_id;
            }
            if zone.is_empty() {
                zone = subnet.availability_zone;
            }
        }

        for (key, value) in [(VPC_ID, vpc_id), (SUBNET_ID, subnet_id), (AVAILABILITY_ZONE, zone)] {
            if !value.is_empty() {
                state.put(key, value);
            }
        }
        StepAction::Continue
    }
}
