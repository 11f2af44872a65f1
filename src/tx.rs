use rlp_derive::{RlpDecodable, RlpEncodable};

use crate::common::{create_addr, Addr, Bytes, Gas, Hash, NullableAddr, Wei};
use crate::core::{CallData, CallKind, ExecError};

/// The signed envelope of a transaction as carried in blocks.
///
/// Signature checking belongs to the transaction pool; the VM trusts `from`.
#[derive(RlpDecodable, RlpEncodable, Clone, Debug, PartialEq)]
pub struct TxBody {
    tx_type: u8,
    nonce: u64,
    gas_price: Wei,
    gas: Gas,
    from: Addr,
    to: NullableAddr,
    value: Wei,
    data: Bytes,
    signature: Bytes,
}

#[derive(Clone, Debug)]
pub struct Tx {
    body: TxBody,
    tx_hash: Hash,
}

impl Tx {
    pub fn new(
        kind: CallKind, nonce: u64, gas_price: Wei, gas: Gas, from: Addr,
        to: Option<Addr>, value: Wei, data: Bytes,
    ) -> Self {
        Self::from_body(TxBody {
            tx_type: kind.as_u8(),
            nonce,
            gas_price,
            gas,
            from,
            to: NullableAddr(to),
            value,
            data,
            signature: Bytes::empty(),
        })
    }

    fn from_body(body: TxBody) -> Self {
        let tx_hash = Hash::hash(&rlp::encode(&body));
        Self { body, tx_hash }
    }

    pub fn with_signature(mut self, signature: Bytes) -> Self {
        self.body.signature = signature;
        Self::from_body(self.body)
    }

    pub fn decode(bytes: &[u8]) -> Option<Tx> {
        let body: TxBody = rlp::decode(bytes).ok()?;
        Some(Self {
            body,
            tx_hash: Hash::hash(bytes),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(&self.body).to_vec()
    }

    pub fn hash(&self) -> &Hash {
        &self.tx_hash
    }

    pub fn kind(&self) -> Result<CallKind, ExecError> {
        CallKind::from_u8(self.body.tx_type)
    }

    pub fn nonce(&self) -> u64 {
        self.body.nonce
    }

    pub fn gas_price(&self) -> &Wei {
        &self.body.gas_price
    }

    pub fn gas(&self) -> Gas {
        self.body.gas
    }

    pub fn from(&self) -> &Addr {
        &self.body.from
    }

    pub fn to(&self) -> Option<&Addr> {
        self.body.to.0.as_ref()
    }

    pub fn value(&self) -> &Wei {
        &self.body.value
    }

    pub fn data(&self) -> &Bytes {
        &self.body.data
    }

    pub fn signature(&self) -> &Bytes {
        &self.body.signature
    }

    /// Address a deploy transaction will create.
    pub fn contract_address(&self) -> Option<Addr> {
        match self.kind() {
            Ok(CallKind::Deploy) => {
                Some(create_addr(&self.body.from, self.body.nonce))
            }
            _ => None,
        }
    }

    /// The root call of this transaction. Deploys carry no recipient, everything else needs
    /// one. Coinbase calls are only ever made by the block processor.
    pub fn call_data(&self) -> Result<CallData, ExecError> {
        let kind = self.kind()?;
        if kind == CallKind::Coinbase {
            return Err(ExecError::InvalidCallKind(kind.as_u8()))
        }
        let to = match (kind, self.to()) {
            (CallKind::Deploy, None) => Addr::zero().clone(),
            (CallKind::Deploy, Some(_)) => {
                return Err(ExecError::MalformedPayload(
                    "deploy with a recipient".into(),
                ))
            }
            (_, Some(to)) => to.clone(),
            (_, None) => {
                return Err(ExecError::MalformedPayload(
                    "missing recipient".into(),
                ))
            }
        };
        let mut call = CallData::new(
            kind,
            self.body.from.clone(),
            to,
            self.body.value.clone(),
            self.body.data.clone(),
        )
        .with_gas(self.body.gas, self.body.gas_price.clone())
        .with_nonce(self.body.nonce);
        call.tx_hash = self.tx_hash.clone();
        call.signature = self.body.signature.clone();
        Ok(call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_codec() {
        let tx = Tx::new(
            CallKind::Transfer,
            3,
            2.into(),
            21000,
            Addr::from(0xa),
            Some(Addr::from(0xb)),
            30.into(),
            Bytes::empty(),
        )
        .with_signature(vec![1, 2, 3].into());
        let raw = tx.encode();
        let decoded = Tx::decode(&raw).unwrap();
        assert_eq!(decoded.hash(), tx.hash());
        assert_eq!(decoded.signature(), &Bytes::from(vec![1, 2, 3]));
        assert_eq!(decoded.to(), Some(&Addr::from(0xb)));
        assert!(Tx::decode(&raw[1..]).is_none());

        let call = decoded.call_data().unwrap();
        assert_eq!(call.kind, CallKind::Transfer);
        assert_eq!(call.tx_nonce, 3);
        assert_eq!(call.gas_limit, 21000);
        assert_eq!(&call.tx_hash, tx.hash());
        assert_eq!(decoded.contract_address(), None);
    }

    #[test]
    fn test_deploy_recipient() {
        let from = Addr::from(0xa);
        let deploy = Tx::new(
            CallKind::Deploy,
            5,
            1.into(),
            100,
            from.clone(),
            None,
            0.into(),
            Bytes::empty(),
        );
        assert_eq!(deploy.contract_address(), Some(create_addr(&from, 5)));
        assert!(deploy.call_data().is_ok());

        let call = Tx::new(
            CallKind::Call,
            0,
            1.into(),
            100,
            from,
            None,
            0.into(),
            Bytes::empty(),
        );
        assert!(matches!(
            call.call_data(),
            Err(ExecError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_user_coinbase() {
        let attacker = Addr::from(0xe);
        let tx = Tx::new(
            CallKind::Coinbase,
            0,
            0.into(),
            0,
            attacker.clone(),
            Some(attacker),
            1_000_000_000.into(),
            Bytes::empty(),
        );
        let raw = tx.encode();
        let decoded = Tx::decode(&raw).unwrap();
        assert_eq!(decoded.kind(), Ok(CallKind::Coinbase));
        assert_eq!(
            decoded.call_data().map(|_| ()),
            Err(ExecError::InvalidCallKind(CallKind::Coinbase.as_u8()))
        );
    }
}
