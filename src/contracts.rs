use ethers::contract::abigen;

// Minimal ABIs for the keeper bot.
//
// Note: we intentionally declare the `uint40` / `uint32` return values as `uint256` in the
// bindings to keep decoding simple and avoid edge cases. ABI encoding is still 32-byte words,
// so decoding as uint256 is safe. Narrowing happens at the call sites with explicit checks.

abigen!(
    SubraFactory,
    r#"[
        function getActivePlans() view returns (uint256[])
        function getSubscriptionContract(uint256 planId) view returns (address)
    ]"#
);

abigen!(
    Subscription,
    r#"[
        function getSubscription(address user) view returns (uint256 startTime, uint256 endTime, bool isActive, uint256 renewalsCount)
        function getAutoRenewalAuth(address user) view returns (bool isEnabled, uint256 maxRenewals, uint256 remainingRenewals, uint256 maxPrice, uint256 authorizedAt)
        function autoRenew(address user) returns (bool)
    ]"#
);
