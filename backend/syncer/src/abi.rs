//! Contract bindings for the factory and per-campaign contracts.
//!
//! Only the read methods and events the mirror consumes are declared.

use alloy_sol_types::sol;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface ICrowdfundingFactory {
        event CampaignCreated(
            uint256 indexed campaignId,
            address indexed campaignAddress,
            address indexed creator,
            uint256 goalAmount,
            uint256 deadline
        );
    }
}

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface ICampaign {
        event ContributionReceived(
            address indexed contributor,
            uint256 amount,
            uint256 totalRaised
        );

        function raisedAmount() external view returns (uint256);
        function isActive() external view returns (bool);
        function isSuccessful() external view returns (bool);
        function title() external view returns (string);
        function description() external view returns (string);
        function imageUrl() external view returns (string);
        function getContribution(address contributor) external view returns (uint256);
        function getStats() external view returns (
            uint256 _raisedAmount,
            uint256 _goalAmount,
            uint256 _contributorCount,
            uint256 _daysLeft,
            uint256 _percentageFunded
        );
    }
}
