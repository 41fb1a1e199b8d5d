//! GraphQL documents for the three indexers (chain blocks, staking pool,
//! AMM). Field names are part of the decoding contract; the documents
//! themselves are plain strings POSTed through the consensus client.

pub const FINALIZED_BLOCK_QUERY: &str = r#"
query getBlock($confirmation_blocks: Int) {
  blocks(skip: $confirmation_blocks, first: 1, orderBy: id, orderDirection: desc) {
    id
    timestamp
  }
}"#;

pub const LATEST_BLOCK_QUERY: &str = r#"
query getBlock {
  blocks(first: 1, orderBy: id, orderDirection: desc) {
    id
    timestamp
  }
}"#;

pub const SYNC_BLOCK_QUERY: &str = r#"
query getMeta {
  _meta {
    block {
      number
    }
  }
}"#;

pub const VOTING_PARAMETERS_QUERY: &str = r#"
query getVotingParameters($block_number: Int) {
  networks(first: 1) {
    oraclesRewardsNonce
    oraclesValidatorsNonce
  }
  pools(first: 1) {
    balance
  }
  merkleDistributors(first: 1) {
    merkleRoot
    merkleProofs
    updatedAtBlock
    rewardsUpdatedAtBlock
  }
  rewardEthTokens(first: 1, block: { number: $block_number }) {
    totalRewards
    totalFees
    distributorPeriodReward
    protocolPeriodReward
    updatedAtBlock
    updatedAtTimestamp
  }
}"#;

pub const REGISTERED_VALIDATORS_QUERY: &str = r#"
query getValidators($block_number: Int, $last_id: ID) {
  validators(
    where: { id_gt: $last_id }
    block: { number: $block_number }
    first: 1000
    orderBy: id
  ) {
    id
  }
}"#;

pub const PERIODIC_DISTRIBUTIONS_QUERY: &str = r#"
query getPeriodicDistributions($from_block: BigInt, $to_block: BigInt, $last_id: ID) {
  periodicDistributions(
    where: { id_gt: $last_id, startedAtBlock_lt: $to_block, endedAtBlock_gt: $from_block }
    first: 1000
    orderBy: id
  ) {
    id
    token
    beneficiary
    amount
    startedAtBlock
    endedAtBlock
  }
}"#;

pub const ONE_TIME_DISTRIBUTIONS_QUERY: &str = r#"
query getOneTimeDistributions($from_block: BigInt, $to_block: BigInt, $last_id: ID) {
  oneTimeDistributions(
    where: { id_gt: $last_id, distributedAtBlock_gt: $from_block, distributedAtBlock_lte: $to_block }
    first: 1000
    orderBy: id
  ) {
    id
    token
    amount
    rewardsLink
    distributedAtBlock
  }
}"#;

pub const DISABLED_STAKER_ACCOUNTS_QUERY: &str = r#"
query getDisabledStakers($block_number: Int, $last_id: ID) {
  rewardEthTokens(first: 1, block: { number: $block_number }) {
    rewardPerStakedEthToken
  }
  stakers(
    where: { id_gt: $last_id, rewardsDisabled: true }
    block: { number: $block_number }
    first: 1000
    orderBy: id
  ) {
    id
    principalBalance
    rewardPerStakedEthToken
  }
}"#;

pub const DISTRIBUTOR_CLAIMED_ACCOUNTS_QUERY: &str = r#"
query getClaimedAccounts($merkle_root: Bytes, $last_id: ID) {
  merkleDistributorClaims(
    where: { id_gt: $last_id, merkleRoot: $merkle_root }
    first: 1000
    orderBy: id
  ) {
    id
    account
  }
}"#;

pub const DISTRIBUTOR_TOKENS_QUERY: &str = r#"
query getDistributorTokens($block_number: Int, $last_id: ID) {
  distributorTokens(
    where: { id_gt: $last_id }
    block: { number: $block_number }
    first: 1000
    orderBy: id
  ) {
    id
  }
}"#;

pub const DISTRIBUTOR_TOKEN_HOLDERS_QUERY: &str = r#"
query getDistributorTokenHolders($token_address: String, $block_number: Int, $last_id: ID) {
  distributorTokenHolders(
    where: { id_gt: $last_id, token: $token_address, amount_gt: 0 }
    block: { number: $block_number }
    first: 1000
    orderBy: id
  ) {
    id
    account
    amount
    distributorPoints
    updatedAtBlock
  }
}"#;

pub const DISTRIBUTOR_REDIRECTS_QUERY: &str = r#"
query getDistributorRedirects($block_number: Int, $last_id: ID) {
  distributorRedirects(
    where: { id_gt: $last_id }
    block: { number: $block_number }
    first: 1000
    orderBy: id
  ) {
    id
    token {
      id
    }
  }
}"#;

pub const UNISWAP_V3_POOLS_QUERY: &str = r#"
query getPools($block_number: Int, $last_id: ID) {
  pools(
    where: { id_gt: $last_id }
    block: { number: $block_number }
    first: 1000
    orderBy: id
  ) {
    id
    token0
    token1
  }
}"#;

pub const UNISWAP_V3_POOL_QUERY: &str = r#"
query getPool($pool_address: ID, $block_number: Int) {
  pools(where: { id: $pool_address }, block: { number: $block_number }) {
    tick
    sqrtPrice
    token0
    token1
  }
}"#;

pub const UNISWAP_V3_POSITIONS_QUERY: &str = r#"
query getPositions($pool_address: String, $block_number: Int, $last_id: ID) {
  positions(
    where: { id_gt: $last_id, pool: $pool_address }
    block: { number: $block_number }
    first: 1000
    orderBy: id
  ) {
    id
    owner
    liquidity
    tickLower
    tickUpper
  }
}"#;

pub const UNISWAP_V3_RANGE_POSITIONS_QUERY: &str = r#"
query getRangePositions($pool_address: String, $tick_lower: BigInt, $tick_upper: BigInt, $block_number: Int, $last_id: ID) {
  positions(
    where: { id_gt: $last_id, pool: $pool_address, tickLower: $tick_lower, tickUpper: $tick_upper }
    block: { number: $block_number }
    first: 1000
    orderBy: id
  ) {
    id
    owner
    liquidity
  }
}"#;

pub const UNISWAP_V3_CURRENT_TICK_POSITIONS_QUERY: &str = r#"
query getCurrentTickPositions($pool_address: String, $tick_current: BigInt, $block_number: Int, $last_id: ID) {
  positions(
    where: {
      id_gt: $last_id
      pool: $pool_address
      tickLower_lte: $tick_current
      tickUpper_gt: $tick_current
    }
    block: { number: $block_number }
    first: 1000
    orderBy: id
  ) {
    id
    owner
    liquidity
  }
}"#;

pub const OPERATORS_QUERY: &str = r#"
query getOperators($block_number: Int) {
  operators(block: { number: $block_number }, orderBy: id) {
    id
    depositDataMerkleProofs
    depositDataIndex
  }
}"#;

pub const LAST_VALIDATORS_QUERY: &str = r#"
query getLastValidators($block_number: Int, $count: Int) {
  validators(
    block: { number: $block_number }
    first: $count
    orderBy: createdAtBlock
    orderDirection: desc
  ) {
    operator {
      id
    }
  }
}"#;

pub const VALIDATOR_REGISTRATIONS_QUERY: &str = r#"
query getValidatorRegistrations($block_number: Int, $public_key: Bytes) {
  validatorRegistrations(block: { number: $block_number }, where: { publicKey: $public_key }) {
    publicKey
  }
}"#;

pub const VALIDATOR_REGISTRATIONS_LATEST_INDEX_QUERY: &str = r#"
query getValidatorRegistrations($block_number: Int) {
  validatorRegistrations(
    block: { number: $block_number }
    first: 1
    orderBy: createdAtBlock
    orderDirection: desc
  ) {
    index
  }
}"#;
