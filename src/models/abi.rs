//! Solidity interfaces of the token standards the indexer decodes.

use alloy_sol_types::sol;

sol! {
    /// ERC-721. ERC-20 shares the signature but leaves `tokenId` unindexed.
    event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);

    /// ERC-1155
    event TransferSingle(
        address indexed operator,
        address indexed from,
        address indexed to,
        uint256 id,
        uint256 value
    );

    /// ERC-1155
    event TransferBatch(
        address indexed operator,
        address indexed from,
        address indexed to,
        uint256[] ids,
        uint256[] values
    );

    /// ERC-721 metadata and most ERC-1155 contracts.
    function name() external view returns (string);
}
