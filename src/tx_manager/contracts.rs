//! Typed bindings for the contracts the agents talk to
//!
//! One `SolCall` per method actually used; encoding and return decoding are
//! generated, so there is no string-keyed ABI lookup at runtime.

use alloy_sol_types::{sol, SolCall};

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface INodeRegistry {
        function registerNode(string metadata) external;
        function registerNodeWithStaking(string metadata, uint256 stake) external;
        function deregisterNode() external;
        function isRegistered(address node) external view returns (bool);
    }

    #[derive(Debug, PartialEq, Eq)]
    interface IERC20 {
        function approve(address spender, uint256 amount) external returns (bool);
        function transfer(address to, uint256 amount) external returns (bool);
        function balanceOf(address owner) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
    }

    #[derive(Debug, PartialEq, Eq)]
    interface IMintable {
        function mint(address to, uint256 amount) external;
    }

    #[derive(Debug, PartialEq, Eq)]
    interface IGovernance {
        function castVote(uint256 proposalId, uint8 support) external returns (uint256);
        function state(uint256 proposalId) external view returns (uint8);
        function hasVoted(uint256 proposalId, address account) external view returns (bool);
    }
}

/// Bare method name of a call, e.g. `registerNodeWithStaking`
pub fn method_name<C: SolCall>() -> &'static str {
    let signature = C::SIGNATURE;
    signature.split('(').next().unwrap_or(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256};

    #[test]
    fn test_method_names() {
        assert_eq!(
            method_name::<INodeRegistry::registerNodeWithStakingCall>(),
            "registerNodeWithStaking"
        );
        assert_eq!(method_name::<INodeRegistry::deregisterNodeCall>(), "deregisterNode");
        assert_eq!(method_name::<IERC20::approveCall>(), "approve");
        assert_eq!(method_name::<IMintable::mintCall>(), "mint");
    }

    #[test]
    fn test_encoding_uses_selector() {
        let call = IERC20::transferCall {
            to: Address::repeat_byte(0x11),
            amount: U256::from(5u64),
        };
        let data = call.abi_encode();
        assert_eq!(&data[..4], &IERC20::transferCall::SELECTOR);
        assert_eq!(data.len(), 4 + 64);
    }

    #[test]
    fn test_decode_return() {
        let mut word = [0u8; 32];
        word[31] = 42;
        let decoded = IERC20::balanceOfCall::abi_decode_returns(&word, true).unwrap();
        assert_eq!(decoded._0, U256::from(42u64));
    }
}
